use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub subscribed: bool,
    pub create_date: DateTime<Utc>,
    pub update_date: DateTime<Utc>,
    pub photos: Vec<Photo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Photo {
    pub id: Uuid,
    pub file_name: String,
    pub original_file_name: Option<String>,
    pub student_id: Uuid,
}

/// Field values submitted when creating a student.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub subscribed: bool,
}

/// Field values submitted when editing a student.
///
/// `email` is required to be present but is never written back.
#[derive(Debug, Clone)]
pub struct StudentEdit {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub subscribed: bool,
    pub change_photos: bool,
}

/// A raw uploaded file: the name it was uploaded under and its content.
#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl PhotoUpload {
    pub fn new<S: Into<String>>(file_name: S, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }
}

/// Treats blank optional text as absent.
pub fn optional_text(value: Option<String>) -> Option<String> {
    value.filter(|it| !it.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_phone_is_absent() {
        assert_eq!(optional_text(Some("   ".to_string())), None);
        assert_eq!(optional_text(None), None);
        assert_eq!(
            optional_text(Some("555".to_string())),
            Some("555".to_string())
        );
    }
}

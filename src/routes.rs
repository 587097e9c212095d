use std::sync::Arc;

use axum::extract::{Extension, Multipart, Path};
use axum::handler::Handler;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use uuid::Uuid;

use crate::err::{handler404, Error};
use crate::models::{NewStudent, PhotoUpload, Student, StudentEdit};
use crate::service::{missing, StudentService};
use crate::{breaks, proceeds, Payload};

pub fn router(service: Arc<StudentService>) -> Router {
    Router::new()
        .route("/students", get(list_students).post(create_student))
        .route(
            "/students/:id",
            get(get_student).post(edit_student).delete(delete_student),
        )
        .fallback(handler404.into_service())
        .layer(Extension(service))
}

pub async fn create_student(
    Extension(service): Extension<Arc<StudentService>>,
    multipart: Multipart,
) -> Payload<Student> {
    let form = read_form(multipart).await?;
    let new = NewStudent {
        name: form.name,
        email: form.email,
        phone: form.phone,
        subscribed: form.subscribed,
    };
    proceeds(service.create(new, form.photos).await?)
}

pub async fn list_students(
    Extension(service): Extension<Arc<StudentService>>,
) -> Payload<StudentList> {
    proceeds(StudentList {
        students: service.list().await?,
    })
}

pub async fn get_student(
    Path(id): Path<String>,
    Extension(service): Extension<Arc<StudentService>>,
) -> Payload<Student> {
    let id = parse_id(&id)?;
    match service.get_by_id(id).await? {
        Some(student) => proceeds(student),
        None => breaks(missing(id)),
    }
}

/// The edit form never carries the student's existing photos; a submission
/// with `change_photos` set replaces the set with exactly what was uploaded.
pub async fn edit_student(
    Path(id): Path<String>,
    Extension(service): Extension<Arc<StudentService>>,
    multipart: Multipart,
) -> Payload<Student> {
    let id = parse_id(&id)?;
    let form = read_form(multipart).await?;
    let edit = StudentEdit {
        id,
        name: form.name,
        email: form.email,
        phone: form.phone,
        subscribed: form.subscribed,
        change_photos: form.change_photos,
    };
    proceeds(service.edit(edit, form.photos).await?)
}

pub async fn delete_student(
    Path(id): Path<String>,
    Extension(service): Extension<Arc<StudentService>>,
) -> Payload<StudentDeleted> {
    let id = parse_id(&id)?;
    if !service.delete_by_id(id).await? {
        return breaks(missing(id));
    }
    proceeds(StudentDeleted {
        student_id: id,
        deleted: true,
    })
}

fn parse_id(id: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(id)
        .map_err(|_| Error::not_found(format!("Student with id `{}` does not exist!", id)))
}

/// Checkbox values as browsers and hidden-field fallbacks send them.
fn checked(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "on" | "1"
    )
}

#[derive(Debug, Default)]
struct StudentForm {
    name: String,
    email: String,
    phone: Option<String>,
    subscribed: bool,
    change_photos: bool,
    photos: Vec<PhotoUpload>,
}

async fn read_form(mut multipart: Multipart) -> Result<StudentForm, Error> {
    let mut form = StudentForm::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "photos" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                // an empty file input still submits a nameless part
                if !file_name.is_empty() {
                    form.photos.push(PhotoUpload::new(file_name, bytes.to_vec()));
                }
            }
            "name" => form.name = field.text().await?,
            "email" => form.email = field.text().await?,
            "phone" => form.phone = Some(field.text().await?),
            "subscribed" => form.subscribed |= checked(&field.text().await?),
            "change_photos" => form.change_photos |= checked(&field.text().await?),
            other => log::debug!("Ignoring form field `{}`", other),
        }
    }
    Ok(form)
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentList {
    pub students: Vec<Student>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDeleted {
    pub student_id: Uuid,
    pub deleted: bool,
}

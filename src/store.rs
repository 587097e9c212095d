use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{Photo, Student};

/// Relational persistence for students and their photos.
///
/// Every student returned by a store carries its full photo list.
#[async_trait]
pub trait StudentStore: Send + Sync {
    async fn email_exists(&self, email: &str) -> Result<bool, Error>;

    /// Inserts `student` and all of `student.photos` atomically. An email that
    /// is already taken is reported as [`Error::ValidationRejected`].
    async fn insert_student(&self, student: &Student) -> Result<(), Error>;

    async fn list_students(&self) -> Result<Vec<Student>, Error>;

    async fn find_student(&self, id: Uuid) -> Result<Option<Student>, Error>;

    /// Writes name, phone, subscribed and update date of `student`, drops the
    /// photo rows in `removed` and inserts `added`, all in one transaction.
    /// Returns `false` when the student row no longer exists.
    async fn update_student(
        &self,
        student: &Student,
        removed: &[Uuid],
        added: &[Photo],
    ) -> Result<bool, Error>;

    /// Deletes the student row; its photo rows go with it.
    async fn delete_student(&self, id: Uuid) -> Result<bool, Error>;
}

pub fn duplicate_email(email: &str) -> Error {
    Error::rejected(format!("Student with email `{}` already exists!", email))
}

/// Process-local store, used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    students: RwLock<Vec<Student>>,
}

#[async_trait]
impl StudentStore for MemoryStore {
    async fn email_exists(&self, email: &str) -> Result<bool, Error> {
        let students = self.students.read().await;
        Ok(students.iter().any(|it| it.email == email))
    }

    async fn insert_student(&self, student: &Student) -> Result<(), Error> {
        let mut students = self.students.write().await;
        if students.iter().any(|it| it.email == student.email) {
            return Err(duplicate_email(&student.email));
        }
        students.push(student.clone());
        Ok(())
    }

    async fn list_students(&self) -> Result<Vec<Student>, Error> {
        Ok(self.students.read().await.clone())
    }

    async fn find_student(&self, id: Uuid) -> Result<Option<Student>, Error> {
        let students = self.students.read().await;
        Ok(students.iter().find(|it| it.id == id).cloned())
    }

    async fn update_student(
        &self,
        student: &Student,
        removed: &[Uuid],
        added: &[Photo],
    ) -> Result<bool, Error> {
        let mut students = self.students.write().await;
        let stored = match students.iter_mut().find(|it| it.id == student.id) {
            Some(stored) => stored,
            None => return Ok(false),
        };
        stored.name = student.name.clone();
        stored.phone = student.phone.clone();
        stored.subscribed = student.subscribed;
        stored.update_date = student.update_date;
        stored.photos.retain(|photo| !removed.contains(&photo.id));
        stored.photos.extend_from_slice(added);
        Ok(true)
    }

    async fn delete_student(&self, id: Uuid) -> Result<bool, Error> {
        let mut students = self.students.write().await;
        let before = students.len();
        students.retain(|it| it.id != id);
        Ok(students.len() < before)
    }
}

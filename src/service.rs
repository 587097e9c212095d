use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::err::Error;
use crate::io::PhotoStore;
use crate::models::{optional_text, NewStudent, Photo, PhotoUpload, Student, StudentEdit};
use crate::store::{duplicate_email, StudentStore};

/// Keeps student rows and the photo directory in step with each other.
pub struct StudentService {
    store: Arc<dyn StudentStore>,
    photos: PhotoStore,
}

fn required(value: &str, field: &str) -> Result<String, Error> {
    if value.trim().is_empty() {
        log::warn!("Rejected student: `{}` is missing", field);
        return Err(Error::rejected(format!("`{}` parameter was empty", field)));
    }
    Ok(value.to_string())
}

fn stored_names(photos: &[Photo]) -> Vec<String> {
    photos.iter().map(|it| it.file_name.clone()).collect()
}

/// Splits an edit into the photos that go away and the uploads that are new,
/// comparing by original file name.
fn diff_photos<'a>(
    current: &'a [Photo],
    submitted: &'a [PhotoUpload],
) -> (Vec<&'a Photo>, Vec<&'a PhotoUpload>) {
    let current_names: HashSet<&str> = current
        .iter()
        .filter_map(|it| it.original_file_name.as_deref())
        .collect();
    let submitted_names: HashSet<&str> = submitted.iter().map(|it| it.file_name.as_str()).collect();

    let gone: HashSet<&str> = current_names.difference(&submitted_names).copied().collect();
    let fresh: HashSet<&str> = submitted_names.difference(&current_names).copied().collect();

    // photos without an original name can never match a submission
    let to_remove = current
        .iter()
        .filter(|it| match it.original_file_name.as_deref() {
            Some(name) => gone.contains(name),
            None => true,
        })
        .collect();

    let mut seen = HashSet::new();
    let to_add = submitted
        .iter()
        .filter(|it| fresh.contains(it.file_name.as_str()) && seen.insert(it.file_name.as_str()))
        .collect();

    (to_remove, to_add)
}

impl StudentService {
    pub fn new(store: Arc<dyn StudentStore>, photos: PhotoStore) -> Self {
        Self { store, photos }
    }

    pub async fn create(
        &self,
        new: NewStudent,
        uploads: Vec<PhotoUpload>,
    ) -> Result<Student, Error> {
        let name = required(&new.name, "name")?;
        let email = required(&new.email, "email")?;

        if self.store.email_exists(&email).await? {
            log::warn!("Rejected student: email `{}` is taken", email);
            return Err(duplicate_email(&email));
        }

        let now = Utc::now();
        let mut student = Student {
            id: Uuid::new_v4(),
            name,
            email,
            phone: optional_text(new.phone),
            subscribed: new.subscribed,
            create_date: now,
            update_date: now,
            photos: Vec::new(),
        };
        student.photos = self.write_photos(student.id, uploads.iter()).await?;

        if let Err(err) = self.store.insert_student(&student).await {
            self.photos.discard(&stored_names(&student.photos)).await;
            return Err(err);
        }

        log::info!(
            "Created student {} with {} photo(s)",
            student.id,
            student.photos.len()
        );
        Ok(student)
    }

    pub async fn list(&self) -> Result<Vec<Student>, Error> {
        self.store.list_students().await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Student>, Error> {
        self.store.find_student(id).await
    }

    /// Overwrites name, phone and subscription. The email is checked for
    /// presence but never changed. Photos are only touched when
    /// `change_photos` is set.
    ///
    /// New photo files are written before the rows are updated and are
    /// removed again if the update fails. Files of dropped photos are deleted
    /// only after the update committed; every one of them is attempted and
    /// the first filesystem fault is returned afterwards.
    pub async fn edit(
        &self,
        edit: StudentEdit,
        uploads: Vec<PhotoUpload>,
    ) -> Result<Student, Error> {
        let name = required(&edit.name, "name")?;
        required(&edit.email, "email")?;

        let mut student = match self.store.find_student(edit.id).await? {
            Some(student) => student,
            None => return Err(missing(edit.id)),
        };

        student.name = name;
        student.phone = optional_text(edit.phone);
        student.subscribed = edit.subscribed;
        student.update_date = Utc::now().max(student.create_date);

        let (removed, added) = if edit.change_photos {
            let (to_remove, to_add) = diff_photos(&student.photos, &uploads);
            let removed: Vec<Photo> = to_remove.into_iter().cloned().collect();
            let added = self.write_photos(student.id, to_add.into_iter()).await?;
            (removed, added)
        } else {
            (Vec::new(), Vec::new())
        };
        let removed_ids: Vec<Uuid> = removed.iter().map(|it| it.id).collect();

        match self.store.update_student(&student, &removed_ids, &added).await {
            Ok(true) => {}
            Ok(false) => {
                self.photos.discard(&stored_names(&added)).await;
                return Err(missing(edit.id));
            }
            Err(err) => {
                self.photos.discard(&stored_names(&added)).await;
                return Err(err);
            }
        }

        let mut first_fault = None;
        for photo in &removed {
            if let Err(err) = self.photos.remove(&photo.file_name).await {
                log::error!("Could not remove photo {}: {:#}", photo.file_name, err);
                first_fault.get_or_insert(err);
            }
        }
        if let Some(err) = first_fault {
            return Err(err.into());
        }

        student.photos.retain(|it| !removed_ids.contains(&it.id));
        student.photos.extend(added);
        log::info!(
            "Edited student {} ({} photo(s) removed, {} now)",
            student.id,
            removed.len(),
            student.photos.len()
        );
        Ok(student)
    }

    pub async fn delete_by_id(&self, id: Uuid) -> Result<bool, Error> {
        let student = match self.store.find_student(id).await? {
            Some(student) => student,
            None => {
                log::warn!("Tried to delete nonexistent student {}", id);
                return Ok(false);
            }
        };

        for photo in &student.photos {
            self.photos.remove(&photo.file_name).await?;
        }

        let deleted = self.store.delete_student(id).await?;
        if deleted {
            log::info!("Deleted student {}", id);
        }
        Ok(deleted)
    }

    /// Writes every upload to the photo directory. If one write fails, the
    /// files already written by this call are removed again.
    async fn write_photos<'a, I>(&self, student_id: Uuid, uploads: I) -> Result<Vec<Photo>, Error>
    where
        I: Iterator<Item = &'a PhotoUpload> + Send,
    {
        let mut written: Vec<Photo> = Vec::new();
        for upload in uploads {
            match self.photos.save(&upload.file_name, &upload.bytes).await {
                Ok(file_name) => written.push(Photo {
                    id: Uuid::new_v4(),
                    file_name,
                    original_file_name: Some(upload.file_name.clone()),
                    student_id,
                }),
                Err(err) => {
                    self.photos.discard(&stored_names(&written)).await;
                    return Err(err.into());
                }
            }
        }
        Ok(written)
    }
}

pub(crate) fn missing(id: Uuid) -> Error {
    Error::not_found(format!("Student with id `{}` does not exist!", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum Fault {
        Insert,
        UpdateFails,
        UpdateFindsNoRow,
    }

    /// Memory store whose writes fail on demand.
    struct FaultyStore {
        inner: MemoryStore,
        fault: Fault,
    }

    #[async_trait]
    impl StudentStore for FaultyStore {
        async fn email_exists(&self, email: &str) -> Result<bool, Error> {
            self.inner.email_exists(email).await
        }

        async fn insert_student(&self, student: &Student) -> Result<(), Error> {
            match self.fault {
                Fault::Insert => Err(duplicate_email(&student.email)),
                _ => self.inner.insert_student(student).await,
            }
        }

        async fn list_students(&self) -> Result<Vec<Student>, Error> {
            self.inner.list_students().await
        }

        async fn find_student(&self, id: Uuid) -> Result<Option<Student>, Error> {
            self.inner.find_student(id).await
        }

        async fn update_student(
            &self,
            student: &Student,
            removed: &[Uuid],
            added: &[Photo],
        ) -> Result<bool, Error> {
            match self.fault {
                Fault::UpdateFails => Err(Error::InternalError {
                    kind: "DatabaseError",
                    message: "connection reset".to_string(),
                }),
                Fault::UpdateFindsNoRow => Ok(false),
                Fault::Insert => self.inner.update_student(student, removed, added).await,
            }
        }

        async fn delete_student(&self, id: Uuid) -> Result<bool, Error> {
            self.inner.delete_student(id).await
        }
    }

    /// A service whose store already holds Alice with `a.png`.
    async fn faulty_service(fault: Fault) -> (StudentService, Student, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoStore::new(dir.path());
        let seeded = StudentService::new(Arc::new(MemoryStore::default()), photos.clone());
        let alice = seeded
            .create(new_student("Alice", "a@x.com"), vec![upload("a.png")])
            .await
            .unwrap();

        let inner = MemoryStore::default();
        inner.insert_student(&alice).await.unwrap();
        let service = StudentService::new(Arc::new(FaultyStore { inner, fault }), photos);
        (service, alice, dir)
    }

    fn service() -> (StudentService, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let service = StudentService::new(
            Arc::new(MemoryStore::default()),
            PhotoStore::new(dir.path()),
        );
        (service, dir)
    }

    fn new_student(name: &str, email: &str) -> NewStudent {
        NewStudent {
            name: name.to_string(),
            email: email.to_string(),
            phone: None,
            subscribed: true,
        }
    }

    fn edit_of(student: &Student, change_photos: bool) -> StudentEdit {
        StudentEdit {
            id: student.id,
            name: student.name.clone(),
            email: student.email.clone(),
            phone: student.phone.clone(),
            subscribed: student.subscribed,
            change_photos,
        }
    }

    fn upload(name: &str) -> PhotoUpload {
        PhotoUpload::new(name, name.as_bytes().to_vec())
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn create_rejects_missing_fields() {
        let (service, dir) = service();
        for (name, email) in [("", "a@x.com"), ("Alice", ""), ("  ", "a@x.com")] {
            let err = service
                .create(new_student(name, email), vec![upload("a.png")])
                .await
                .unwrap_err();
            assert!(matches!(err, Error::ValidationRejected { .. }));
        }
        assert!(service.list().await.unwrap().is_empty());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email_case_sensitively() {
        let (service, _dir) = service();
        service
            .create(new_student("Alice", "a@x.com"), vec![])
            .await
            .unwrap();

        let err = service
            .create(new_student("Bob", "a@x.com"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationRejected { .. }));

        service
            .create(new_student("Bob", "A@x.com"), vec![])
            .await
            .unwrap();
        assert_eq!(service.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn create_writes_photos_with_generated_names() {
        let (service, dir) = service();
        let student = service
            .create(
                new_student("Alice", "a@x.com"),
                vec![upload("one.png"), upload("two.jpg")],
            )
            .await
            .unwrap();

        assert_eq!(student.photos.len(), 2);
        assert_eq!(student.create_date, student.update_date);
        for (photo, original) in student.photos.iter().zip(["one.png", "two.jpg"]) {
            assert_eq!(photo.original_file_name.as_deref(), Some(original));
            assert_ne!(photo.file_name, original);
            assert_eq!(photo.student_id, student.id);
            let content = std::fs::read(dir.path().join(&photo.file_name)).unwrap();
            assert_eq!(content, original.as_bytes());
        }
        assert!(student.photos[0].file_name.ends_with(".png"));
        assert!(student.photos[1].file_name.ends_with(".jpg"));

        let found = service.get_by_id(student.id).await.unwrap().unwrap();
        assert_eq!(found.photos, student.photos);
    }

    #[tokio::test]
    async fn create_leaves_nothing_behind_when_a_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = StudentService::new(
            Arc::new(MemoryStore::default()),
            PhotoStore::new(dir.path().join("missing")),
        );
        let err = service
            .create(new_student("Alice", "a@x.com"), vec![upload("a.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InternalError { kind: "IOError", .. }));
        assert!(service.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_removes_written_files_when_insert_fails() {
        let (service, _alice, dir) = faulty_service(Fault::Insert).await;
        let err = service
            .create(
                new_student("Bob", "b@x.com"),
                vec![upload("b.png"), upload(".png")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationRejected { .. }));
        // only Alice's photo is left
        assert_eq!(files_in(dir.path()), 1);
    }

    #[tokio::test]
    async fn edit_removes_new_files_when_update_fails() {
        let (service, alice, dir) = faulty_service(Fault::UpdateFails).await;
        let err = service
            .edit(edit_of(&alice, true), vec![upload("b.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InternalError { kind: "DatabaseError", .. }));
        assert_eq!(files_in(dir.path()), 1);
        assert!(dir.path().join(&alice.photos[0].file_name).exists());
    }

    #[tokio::test]
    async fn edit_of_student_deleted_meanwhile_is_not_found() {
        let (service, alice, dir) = faulty_service(Fault::UpdateFindsNoRow).await;
        let err = service
            .edit(edit_of(&alice, true), vec![upload("b.png"), upload("c.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(files_in(dir.path()), 1);
        assert!(dir.path().join(&alice.photos[0].file_name).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn edit_attempts_every_removal_before_reporting_a_fault() {
        let (service, dir) = service();
        let alice = service
            .create(
                new_student("Alice", "a@x.com"),
                vec![upload("a.png"), upload("b.png")],
            )
            .await
            .unwrap();
        // a directory in place of the first file makes its removal fail
        let blocked = dir.path().join(&alice.photos[0].file_name);
        std::fs::remove_file(&blocked).unwrap();
        std::fs::create_dir(&blocked).unwrap();

        let err = service.edit(edit_of(&alice, true), vec![]).await.unwrap_err();
        assert!(matches!(err, Error::InternalError { kind: "IOError", .. }));
        assert!(!dir.path().join(&alice.photos[1].file_name).exists());

        let stored = service.get_by_id(alice.id).await.unwrap().unwrap();
        assert!(stored.photos.is_empty());
    }

    #[tokio::test]
    async fn edit_overwrites_fields_but_not_email() {
        let (service, _dir) = service();
        let alice = service
            .create(new_student("Alice", "a@x.com"), vec![])
            .await
            .unwrap();

        let edited = service
            .edit(
                StudentEdit {
                    id: alice.id,
                    name: "Alicia".to_string(),
                    email: "changed@x.com".to_string(),
                    phone: Some("555".to_string()),
                    subscribed: false,
                    change_photos: false,
                },
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(edited.name, "Alicia");
        assert_eq!(edited.email, "a@x.com");
        assert_eq!(edited.phone.as_deref(), Some("555"));
        assert!(!edited.subscribed);
        assert!(edited.update_date >= edited.create_date);
        assert_eq!(edited.create_date, alice.create_date);

        let stored = service.get_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Alicia");
        assert_eq!(stored.email, "a@x.com");
    }

    #[tokio::test]
    async fn edit_rejects_missing_fields_and_unknown_ids() {
        let (service, _dir) = service();
        let alice = service
            .create(new_student("Alice", "a@x.com"), vec![])
            .await
            .unwrap();

        let mut edit = edit_of(&alice, false);
        edit.email = String::new();
        let err = service.edit(edit, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::ValidationRejected { .. }));

        let mut edit = edit_of(&alice, false);
        edit.id = Uuid::new_v4();
        let err = service.edit(edit, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn edit_without_change_photos_keeps_photo_set() {
        let (service, dir) = service();
        let alice = service
            .create(new_student("Alice", "a@x.com"), vec![upload("a.png")])
            .await
            .unwrap();

        let edited = service
            .edit(edit_of(&alice, false), vec![upload("b.png")])
            .await
            .unwrap();
        assert_eq!(edited.photos, alice.photos);
        assert_eq!(files_in(dir.path()), 1);
    }

    #[tokio::test]
    async fn edit_with_change_photos_syncs_by_original_name() {
        let (service, dir) = service();
        let alice = service
            .create(
                new_student("Alice", "a@x.com"),
                vec![upload("keep.png"), upload("drop.png")],
            )
            .await
            .unwrap();
        let keep = alice.photos[0].clone();
        let drop = alice.photos[1].clone();

        let edited = service
            .edit(
                edit_of(&alice, true),
                vec![upload("keep.png"), upload("new.gif"), upload("new.gif")],
            )
            .await
            .unwrap();

        assert_eq!(edited.photos.len(), 2);
        assert!(edited.photos.contains(&keep));
        assert!(!edited.photos.contains(&drop));
        let added = edited
            .photos
            .iter()
            .find(|it| it.original_file_name.as_deref() == Some("new.gif"))
            .unwrap();
        assert!(added.file_name.ends_with(".gif"));

        assert!(dir.path().join(&keep.file_name).exists());
        assert!(!dir.path().join(&drop.file_name).exists());
        assert!(dir.path().join(&added.file_name).exists());
        assert_eq!(files_in(dir.path()), 2);

        let stored = service.get_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!(stored.photos, edited.photos);
    }

    #[tokio::test]
    async fn edit_tolerates_missing_backing_file() {
        let (service, dir) = service();
        let alice = service
            .create(new_student("Alice", "a@x.com"), vec![upload("a.png")])
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join(&alice.photos[0].file_name)).unwrap();

        let edited = service.edit(edit_of(&alice, true), vec![]).await.unwrap();
        assert!(edited.photos.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_rows_and_files() {
        let (service, dir) = service();
        let alice = service
            .create(
                new_student("Alice", "a@x.com"),
                vec![upload("a.png"), upload("b.png")],
            )
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join(&alice.photos[0].file_name)).unwrap();

        assert!(service.delete_by_id(alice.id).await.unwrap());
        assert!(service.get_by_id(alice.id).await.unwrap().is_none());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn delete_of_unknown_id_changes_nothing() {
        let (service, dir) = service();
        service
            .create(new_student("Alice", "a@x.com"), vec![upload("a.png")])
            .await
            .unwrap();

        assert!(!service.delete_by_id(Uuid::new_v4()).await.unwrap());
        assert_eq!(service.list().await.unwrap().len(), 1);
        assert_eq!(files_in(dir.path()), 1);
    }

    #[tokio::test]
    async fn alice_lifecycle() {
        let (service, _dir) = service();
        let alice = service
            .create(new_student("Alice", "a@x.com"), vec![])
            .await
            .unwrap();
        assert!(alice.photos.is_empty());

        let mut bob = new_student("Bob", "a@x.com");
        bob.subscribed = false;
        assert!(service.create(bob, vec![]).await.is_err());

        let edited = service
            .edit(
                StudentEdit {
                    id: alice.id,
                    name: "Alicia".to_string(),
                    email: "a@x.com".to_string(),
                    phone: Some("555".to_string()),
                    subscribed: false,
                    change_photos: false,
                },
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(edited.name, "Alicia");
        assert_eq!(edited.email, "a@x.com");

        assert!(service.delete_by_id(alice.id).await.unwrap());
        assert!(service.get_by_id(alice.id).await.unwrap().is_none());
    }

    #[test]
    fn diff_is_two_set_differences() {
        let student_id = Uuid::new_v4();
        let photo = |original: Option<&str>| Photo {
            id: Uuid::new_v4(),
            file_name: format!("{}.png", Uuid::new_v4()),
            original_file_name: original.map(str::to_string),
            student_id,
        };
        let current = vec![photo(Some("a.png")), photo(Some("b.png")), photo(None)];
        let submitted = vec![upload("b.png"), upload("c.png")];

        let (to_remove, to_add) = diff_photos(&current, &submitted);
        let removed: Vec<_> = to_remove
            .iter()
            .map(|it| it.original_file_name.as_deref())
            .collect();
        assert_eq!(removed, vec![Some("a.png"), None]);
        let added: Vec<_> = to_add.iter().map(|it| it.file_name.as_str()).collect();
        assert_eq!(added, vec!["c.png"]);
    }
}

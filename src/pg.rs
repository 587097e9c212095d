use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::err::Error;
use crate::models::{Photo, Student};
use crate::store::{duplicate_email, StudentStore};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS students (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        phone TEXT,
        subscribed BOOLEAN NOT NULL,
        create_date TIMESTAMPTZ NOT NULL,
        update_date TIMESTAMPTZ NOT NULL,
        CHECK (update_date >= create_date)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS students_email_key ON students (email)",
    "CREATE TABLE IF NOT EXISTS photos (
        id UUID PRIMARY KEY,
        file_name TEXT NOT NULL UNIQUE,
        original_file_name TEXT,
        student_id UUID NOT NULL REFERENCES students (id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS photos_student_id_idx ON photos (student_id)",
];

const UNIQUE_VIOLATION: &str = "23505";

#[derive(sqlx::FromRow)]
struct StudentRow {
    id: Uuid,
    name: String,
    email: String,
    phone: Option<String>,
    subscribed: bool,
    create_date: DateTime<Utc>,
    update_date: DateTime<Utc>,
}

impl From<StudentRow> for Student {
    fn from(row: StudentRow) -> Self {
        Student {
            id: row.id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            subscribed: row.subscribed,
            create_date: row.create_date,
            update_date: row.update_date,
            photos: Vec::new(),
        }
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the tables and indexes that are still missing.
    pub async fn migrate(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn attach_photos(&self, students: &mut [Student]) -> Result<(), Error> {
        if students.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = students.iter().map(|it| it.id).collect();
        let photos = sqlx::query_as::<_, Photo>(
            "SELECT * FROM photos WHERE student_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_student: HashMap<Uuid, Vec<Photo>> = HashMap::new();
        for photo in photos {
            by_student.entry(photo.student_id).or_default().push(photo);
        }
        for student in students.iter_mut() {
            student.photos = by_student.remove(&student.id).unwrap_or_default();
        }
        Ok(())
    }
}

async fn insert_photos(tx: &mut Transaction<'_, Postgres>, photos: &[Photo]) -> Result<(), Error> {
    for photo in photos {
        sqlx::query("INSERT INTO photos VALUES ($1, $2, $3, $4)")
            .bind(&photo.id)
            .bind(&photo.file_name)
            .bind(&photo.original_file_name)
            .bind(&photo.student_id)
            .execute(&mut *tx)
            .await?;
    }
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[async_trait]
impl StudentStore for PgStore {
    async fn email_exists(&self, email: &str) -> Result<bool, Error> {
        let found = sqlx::query("SELECT 1 FROM students WHERE email = $1 LIMIT 1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn insert_student(&self, student: &Student) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query("INSERT INTO students VALUES ($1, $2, $3, $4, $5, $6, $7)")
            .bind(&student.id)
            .bind(&student.name)
            .bind(&student.email)
            .bind(&student.phone)
            .bind(student.subscribed)
            .bind(&student.create_date)
            .bind(&student.update_date)
            .execute(&mut tx)
            .await;
        match inserted {
            Err(err) if is_unique_violation(&err) => return Err(duplicate_email(&student.email)),
            other => other?,
        };
        insert_photos(&mut tx, &student.photos).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_students(&self) -> Result<Vec<Student>, Error> {
        let rows = sqlx::query_as::<_, StudentRow>("SELECT * FROM students ORDER BY create_date")
            .fetch_all(&self.pool)
            .await?;
        let mut students: Vec<Student> = rows.into_iter().map(Student::from).collect();
        self.attach_photos(&mut students).await?;
        Ok(students)
    }

    async fn find_student(&self, id: Uuid) -> Result<Option<Student>, Error> {
        let row = sqlx::query_as::<_, StudentRow>("SELECT * FROM students WHERE id = $1 LIMIT 1")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?;

        let mut found: Vec<Student> = row.into_iter().map(Student::from).collect();
        self.attach_photos(&mut found).await?;
        Ok(found.pop())
    }

    async fn update_student(
        &self,
        student: &Student,
        removed: &[Uuid],
        added: &[Photo],
    ) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            "UPDATE students SET name = $2, phone = $3, subscribed = $4, update_date = $5 WHERE id = $1",
        )
        .bind(&student.id)
        .bind(&student.name)
        .bind(&student.phone)
        .bind(student.subscribed)
        .bind(&student.update_date)
        .execute(&mut tx)
        .await?;

        if res.rows_affected() < 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        if !removed.is_empty() {
            sqlx::query("DELETE FROM photos WHERE student_id = $1 AND id = ANY($2)")
                .bind(&student.id)
                .bind(removed)
                .execute(&mut tx)
                .await?;
        }
        insert_photos(&mut tx, added).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_student(&self, id: Uuid) -> Result<bool, Error> {
        let affected = sqlx::query("DELETE FROM students WHERE id = $1")
            .bind(&id)
            .execute(&self.pool)
            .await?;
        Ok(affected.rows_affected() >= 1)
    }
}

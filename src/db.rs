use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
    ConnectOptions, Pool, Row, Sqlite,
};
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::{CachedQuestion, Intensity, NewNote, NewReviewEvent, Note, NoteUpdate, ReviewEvent};
use crate::srs::INITIAL_EASE;

impl<'r> sqlx::FromRow<'r, SqliteRow> for Note {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let intensity: String = row.try_get("intensity")?;
        let intensity = Intensity::from_str(&intensity).map_err(|e| sqlx::Error::ColumnDecode {
            index: "intensity".to_string(),
            source: Box::new(e),
        })?;

        let ease_factor: f64 = row.try_get("ease_factor").unwrap_or(INITIAL_EASE);
        let current_interval: i64 = row.try_get("current_interval").unwrap_or(0);
        let review_count: i64 = row.try_get("review_count").unwrap_or(0);

        Ok(Note {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            intensity,
            color: row.try_get("color")?,
            ease_factor,
            current_interval: current_interval.max(0) as u32,
            last_interval_ms: row.try_get("last_interval_ms")?,
            review_count: review_count.max(0) as u32,
            last_reviewed: row.try_get("last_reviewed")?,
            next_review_at: row.try_get("next_review_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ReviewEvent {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(ReviewEvent {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            note_id: row.try_get("note_id")?,
            question: row.try_get("question")?,
            model: row.try_get("model")?,
            user_response: row.try_get("user_response")?,
            is_correct: row.try_get("is_correct")?,
            feedback: row.try_get("feedback")?,
            difficulty_rating: row.try_get("difficulty_rating")?,
            response_time_secs: row.try_get("response_time_secs")?,
            next_review_date: row.try_get("next_review_date")?,
            reviewed_at: row.try_get("reviewed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for CachedQuestion {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(CachedQuestion {
            note_id: row.try_get("note_id")?,
            question: row.try_get("question")?,
            model: row.try_get("model")?,
            generated_at: row.try_get("generated_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

/// Scheduling fields written after a review. Engines only fill the fields
/// they own; the rest are carried over from the note as read.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleUpdate {
    pub ease_factor: f64,
    pub current_interval: u32,
    pub last_interval_ms: Option<i64>,
    pub review_count: u32,
    pub last_reviewed: Option<DateTime<Utc>>,
    pub next_review_at: DateTime<Utc>,
}

impl ScheduleUpdate {
    pub fn from_note(note: &Note) -> Self {
        Self {
            ease_factor: note.ease_factor,
            current_interval: note.current_interval,
            last_interval_ms: note.last_interval_ms,
            review_count: note.review_count,
            last_reviewed: note.last_reviewed,
            next_review_at: note.next_review_at,
        }
    }
}

/// SQLite-backed note store, review log and question cache.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let db = Db { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Private in-memory database, used by tests. A single connection keeps
    /// every query on the same memory database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Db { pool };
        db.migrate().await?;

        Ok(db)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT,
                description TEXT NOT NULL,
                intensity TEXT NOT NULL DEFAULT 'moderate',
                color TEXT,
                ease_factor REAL NOT NULL DEFAULT 2.5,
                current_interval INTEGER NOT NULL DEFAULT 0,
                last_interval_ms INTEGER,
                review_count INTEGER NOT NULL DEFAULT 0,
                last_reviewed DATETIME,
                next_review_at DATETIME NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                note_id INTEGER NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
                question TEXT NOT NULL,
                model TEXT NOT NULL,
                user_response TEXT NOT NULL,
                is_correct BOOLEAN NOT NULL,
                feedback TEXT NOT NULL DEFAULT '',
                difficulty_rating REAL NOT NULL
                    CHECK (difficulty_rating >= 1 AND difficulty_rating <= 5),
                response_time_secs REAL NOT NULL DEFAULT 0,
                next_review_date DATETIME NOT NULL,
                reviewed_at DATETIME NOT NULL,
                created_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS question_cache (
                note_id INTEGER PRIMARY KEY REFERENCES notes(id) ON DELETE CASCADE,
                question TEXT NOT NULL,
                model TEXT NOT NULL,
                generated_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_reviews_note ON reviews(note_id, reviewed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_reviews_session ON reviews(session_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn create_note(&self, input: NewNote, now: DateTime<Utc>) -> Result<Note> {
        input.validate().map_err(Error::Validation)?;

        let id = sqlx::query(
            r#"
            INSERT INTO notes (title, description, intensity, color, ease_factor, current_interval,
                               review_count, next_review_at, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, 0, ?, 0, ?, ?)
            "#,
        )
        .bind(&input.title)
        .bind(&input.description)
        .bind(input.intensity.as_str())
        .bind(&input.color)
        .bind(INITIAL_EASE)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        log::info!("Created note {} ({})", id, input.intensity);
        Ok(Note::new(id, input, now))
    }

    pub async fn get_note(&self, id: i64) -> Result<Note> {
        sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::note_not_found(id))
    }

    pub async fn list_notes(&self, intensity: Option<Intensity>) -> Result<Vec<Note>> {
        let notes = match intensity {
            Some(intensity) => {
                sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE intensity = ? ORDER BY id")
                    .bind(intensity.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as::<_, Note>("SELECT * FROM notes ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(notes)
    }

    pub async fn update_note(&self, id: i64, update: &NoteUpdate, now: DateTime<Utc>) -> Result<Note> {
        let mut tx = self.pool.begin().await?;

        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::note_not_found(id))?;

        let description = update.description.clone().unwrap_or(note.description);
        if description.trim().is_empty() {
            return Err(Error::Validation("description must not be empty".to_string()));
        }
        let title = update.title.clone().or(note.title);
        let intensity = update.intensity.unwrap_or(note.intensity);
        let color = update.color.clone().or(note.color);

        sqlx::query(
            "UPDATE notes SET title = ?, description = ?, intensity = ?, color = ?, version = version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(&title)
        .bind(&description)
        .bind(intensity.as_str())
        .bind(&color)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(updated)
    }

    /// Deletes a note together with its review history and cached question.
    pub async fn delete_note(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM question_cache WHERE note_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let reviews = sqlx::query("DELETE FROM reviews WHERE note_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let deleted = sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(Error::note_not_found(id));
        }

        tx.commit().await?;
        log::info!("Deleted note {} and {} review(s)", id, reviews);
        Ok(())
    }

    /// Writes the new schedule and appends the review event atomically.
    /// Fails with `Conflict` when the note changed since `expected_version`.
    pub async fn record_review(
        &self,
        note_id: i64,
        expected_version: i64,
        schedule: &ScheduleUpdate,
        event: &NewReviewEvent,
        now: DateTime<Utc>,
    ) -> Result<ReviewEvent> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE notes
            SET ease_factor = ?, current_interval = ?, last_interval_ms = ?, review_count = ?,
                last_reviewed = ?, next_review_at = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(schedule.ease_factor)
        .bind(schedule.current_interval as i64)
        .bind(schedule.last_interval_ms)
        .bind(schedule.review_count as i64)
        .bind(schedule.last_reviewed)
        .bind(schedule.next_review_at)
        .bind(now)
        .bind(note_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: i64 = sqlx::query_scalar("SELECT count(*) FROM notes WHERE id = ?")
                .bind(note_id)
                .fetch_one(&mut *tx)
                .await?;
            return Err(if exists == 0 {
                Error::note_not_found(note_id)
            } else {
                Error::Conflict { note_id }
            });
        }

        let event = insert_review(&mut tx, event, now).await?;
        tx.commit().await?;
        Ok(event)
    }

    pub async fn append_review(&self, event: &NewReviewEvent, now: DateTime<Utc>) -> Result<ReviewEvent> {
        let mut tx = self.pool.begin().await?;
        let event = insert_review(&mut tx, event, now).await?;
        tx.commit().await?;
        Ok(event)
    }

    pub async fn reviews_for_note(&self, note_id: i64) -> Result<Vec<ReviewEvent>> {
        let events = sqlx::query_as::<_, ReviewEvent>(
            "SELECT * FROM reviews WHERE note_id = ? ORDER BY reviewed_at, id",
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn reviews_for_session(&self, session_id: &str) -> Result<Vec<ReviewEvent>> {
        let events = sqlx::query_as::<_, ReviewEvent>(
            "SELECT * FROM reviews WHERE session_id = ? ORDER BY reviewed_at, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn all_reviews(&self) -> Result<Vec<ReviewEvent>> {
        let events = sqlx::query_as::<_, ReviewEvent>("SELECT * FROM reviews ORDER BY reviewed_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }

    pub async fn last_review(&self, note_id: i64) -> Result<Option<ReviewEvent>> {
        let event = sqlx::query_as::<_, ReviewEvent>(
            "SELECT * FROM reviews WHERE note_id = ? ORDER BY reviewed_at DESC, id DESC LIMIT 1",
        )
        .bind(note_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    pub async fn put_cached_question(&self, entry: &CachedQuestion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO question_cache (note_id, question, model, generated_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(note_id) DO UPDATE SET
                question = excluded.question,
                model = excluded.model,
                generated_at = excluded.generated_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(entry.note_id)
        .bind(&entry.question)
        .bind(&entry.model)
        .bind(entry.generated_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cached_question(&self, note_id: i64) -> Result<Option<CachedQuestion>> {
        let entry = sqlx::query_as::<_, CachedQuestion>("SELECT * FROM question_cache WHERE note_id = ?")
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    pub async fn all_cached_questions(&self) -> Result<Vec<CachedQuestion>> {
        let entries = sqlx::query_as::<_, CachedQuestion>("SELECT * FROM question_cache ORDER BY note_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    pub async fn delete_cached_question(&self, note_id: i64) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM question_cache WHERE note_id = ?")
            .bind(note_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn delete_expired_questions(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM question_cache WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}

async fn insert_review(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    event: &NewReviewEvent,
    now: DateTime<Utc>,
) -> Result<ReviewEvent> {
    if !(1.0..=5.0).contains(&event.difficulty_rating) {
        return Err(Error::Validation(format!(
            "difficulty_rating must be between 1 and 5 (got {})",
            event.difficulty_rating
        )));
    }

    let id = sqlx::query(
        r#"
        INSERT INTO reviews (session_id, note_id, question, model, user_response, is_correct, feedback,
                             difficulty_rating, response_time_secs, next_review_date, reviewed_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.session_id)
    .bind(event.note_id)
    .bind(&event.question)
    .bind(&event.model)
    .bind(&event.user_response)
    .bind(event.is_correct)
    .bind(&event.feedback)
    .bind(event.difficulty_rating)
    .bind(event.response_time_secs)
    .bind(event.next_review_date)
    .bind(event.reviewed_at)
    .bind(now)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    Ok(ReviewEvent {
        id,
        session_id: event.session_id.clone(),
        note_id: event.note_id,
        question: event.question.clone(),
        model: event.model.clone(),
        user_response: event.user_response.clone(),
        is_correct: event.is_correct,
        feedback: event.feedback.clone(),
        difficulty_rating: event.difficulty_rating,
        response_time_secs: event.response_time_secs,
        next_review_date: event.next_review_date,
        reviewed_at: event.reviewed_at,
        created_at: now,
    })
}

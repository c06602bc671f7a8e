// ABOUTME: SQLite persistence for per-user sandbox lifecycle records
// ABOUTME: Upserts records on stable transitions and loads them back at startup

use crate::state::{PersistedRecord, SandboxState, StateError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid state: {0}")]
    InvalidState(#[from] StateError),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and apply migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.migrate().await?;
        info!("Sandbox record storage ready at {}", url);
        Ok(storage)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_record(&self, record: &PersistedRecord) -> Result<()> {
        let history = serde_json::to_string(&record.state_history)?;

        sqlx::query(
            r#"
            INSERT INTO sandbox_records (
                user_id, sandbox_name, current_state, state_history,
                last_transition_time, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(user_id) DO UPDATE SET
                sandbox_name = excluded.sandbox_name,
                current_state = excluded.current_state,
                state_history = excluded.state_history,
                last_transition_time = excluded.last_transition_time,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.sandbox_name)
        .bind(record.current_state.as_str())
        .bind(history)
        .bind(record.last_transition_time.to_rfc3339())
        .bind(&record.last_error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            "Persisted sandbox record for {} in state {}",
            record.user_id, record.current_state
        );
        Ok(())
    }

    pub async fn get_record(&self, user_id: &str) -> Result<Option<PersistedRecord>> {
        let row = sqlx::query(
            "SELECT user_id, sandbox_name, current_state, state_history, last_transition_time, last_error
             FROM sandbox_records WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    pub async fn list_records(&self) -> Result<Vec<PersistedRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, sandbox_name, current_state, state_history, last_transition_time, last_error
             FROM sandbox_records ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    pub async fn delete_record(&self, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sandbox_records WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn row_to_record(row: SqliteRow) -> Result<PersistedRecord> {
        let raw_time: String = row.get("last_transition_time");
        let last_transition_time = DateTime::parse_from_rfc3339(&raw_time)
            .map_err(|e| StorageError::InvalidTimestamp(format!("{}: {}", raw_time, e)))?
            .with_timezone(&Utc);

        Ok(PersistedRecord {
            user_id: row.get("user_id"),
            sandbox_name: row.get("sandbox_name"),
            current_state: SandboxState::from_str(&row.get::<String, _>("current_state"))?,
            state_history: serde_json::from_str(&row.get::<String, _>("state_history"))?,
            last_transition_time,
            last_error: row.get("last_error"),
        })
    }
}

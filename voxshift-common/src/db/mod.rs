//! Generation ledger
//!
//! SQLite persistence for audio rows and generation requests. The worker only
//! touches these two tables; everything else in the product schema lives
//! elsewhere.

pub mod audio;
pub mod generations;

pub use audio::{AudioRecord, AudioSource, NewAudio};
pub use generations::{GenerationOutput, GenerationRecord, GenerationTarget, NewGeneration};

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings every pooled connection is opened with. Pragmas such as
/// `foreign_keys` are per connection, so they belong here rather than in a
/// one-off query.
fn connection_options(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options.foreign_keys(true).busy_timeout(BUSY_TIMEOUT)
}

/// Handle to the ledger database
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (creating if needed) the database at `db_path` and ensure the schema
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = connection_options(SqliteConnectOptions::new().filename(db_path))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Initialized new ledger: {}", db_path.display());
        } else {
            info!("Opened existing ledger: {}", db_path.display());
        }

        let ledger = Self { pool };
        ledger.init().await?;
        Ok(ledger)
    }

    /// Private in-memory database. One connection, kept alive for the life of
    /// the pool, so every query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = connection_options(SqliteConnectOptions::from_str("sqlite::memory:")?);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.init().await?;
        Ok(ledger)
    }

    async fn init(&self) -> Result<()> {
        create_audio_table(&self.pool).await?;
        create_generations_table(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

async fn create_audio_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audio (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            name TEXT NOT NULL,
            source TEXT NOT NULL CHECK (source IN ('upload', 'generation')),
            blob_key TEXT NOT NULL,
            sample_rate INTEGER NOT NULL,
            num_frames INTEGER NOT NULL,
            available INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_generations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            source_id INTEGER NOT NULL REFERENCES audio(id),
            reference_id INTEGER NOT NULL REFERENCES audio(id),
            output_id INTEGER REFERENCES audio(id) ON DELETE SET NULL,
            model TEXT,
            elapsed_time REAL,
            created_at TEXT NOT NULL,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_generations_pending ON generations(created_at) WHERE output_id IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Fixed-width UTC RFC 3339 so stored timestamps compare lexicographically
pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp {:?}: {}", raw, e)))
}

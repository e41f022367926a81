//! Generation request rows
//!
//! A generation is pending while `output_id` is NULL. The worker is the only
//! writer after creation: it either completes the row (output, model, timing)
//! or deletes it when processing fails.

use super::audio::{insert_audio_on, AudioRecord, NewAudio};
use super::{parse_timestamp, timestamp, Ledger};
use crate::{AudioId, Error, GenerationId, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRecord {
    pub id: GenerationId,
    pub user_id: Option<i64>,
    pub source_id: AudioId,
    pub reference_id: AudioId,
    pub output_id: Option<AudioId>,
    pub model: Option<String>,
    pub elapsed_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationRecord {
    pub fn is_complete(&self) -> bool {
        self.output_id.is_some()
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let output_id: Option<i64> = row.get("output_id");
        let created_at: String = row.get("created_at");
        let finished_at: Option<String> = row.get("finished_at");

        Ok(Self {
            id: GenerationId::new(row.get("id")),
            user_id: row.get("user_id"),
            source_id: AudioId::new(row.get("source_id")),
            reference_id: AudioId::new(row.get("reference_id")),
            output_id: output_id.map(AudioId::new),
            model: row.get("model"),
            elapsed_time: row.get("elapsed_time"),
            created_at: parse_timestamp(&created_at)?,
            finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewGeneration {
    pub user_id: Option<i64>,
    pub source_id: AudioId,
    pub reference_id: AudioId,
}

/// Which generation row a finished output belongs to
#[derive(Debug, Clone)]
pub enum GenerationTarget {
    /// Fill in a pending row (queue topology)
    Pending(GenerationId),
    /// Insert an already-finished row (dispatch topology)
    New(NewGeneration),
}

/// Everything written when a generation finishes
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub target: GenerationTarget,
    pub audio: NewAudio,
    pub model: String,
    pub elapsed_time: f64,
}

const GENERATION_COLUMNS: &str = "id, user_id, source_id, reference_id, output_id, model, elapsed_time, created_at, finished_at";

impl Ledger {
    pub async fn create_generation(&self, generation: &NewGeneration) -> Result<GenerationRecord> {
        let result = sqlx::query(
            "INSERT INTO generations (user_id, source_id, reference_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(generation.user_id)
        .bind(generation.source_id.get())
        .bind(generation.reference_id.get())
        .bind(timestamp(Utc::now()))
        .execute(self.pool())
        .await?;

        self.get_generation(GenerationId::new(result.last_insert_rowid()))
            .await
    }

    pub async fn get_generation(&self, id: GenerationId) -> Result<GenerationRecord> {
        let sql = format!("SELECT {} FROM generations WHERE id = ?", GENERATION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Generation {}", id)))?;

        GenerationRecord::from_row(&row)
    }

    /// Returns whether a row was deleted
    pub async fn delete_generation(&self, id: GenerationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM generations WHERE id = ?")
            .bind(id.get())
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Write the output audio row and the finished generation row in one
    /// transaction.
    ///
    /// For [`GenerationTarget::Pending`] the row must still exist and have no
    /// output, otherwise nothing is written and `NotFound` is returned.
    pub async fn complete_generation(
        &self,
        output: &GenerationOutput,
    ) -> Result<(AudioRecord, GenerationRecord)> {
        let finished_at = timestamp(Utc::now());
        let mut tx = self.pool().begin().await?;

        let audio_id = insert_audio_on(&mut tx, &output.audio).await?;

        let generation_id = match &output.target {
            GenerationTarget::Pending(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE generations
                    SET output_id = ?, model = ?, elapsed_time = ?, finished_at = ?
                    WHERE id = ? AND output_id IS NULL
                    "#,
                )
                .bind(audio_id.get())
                .bind(&output.model)
                .bind(output.elapsed_time)
                .bind(&finished_at)
                .bind(id.get())
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    // Dropping the transaction rolls back the audio insert
                    return Err(Error::NotFound(format!("Pending generation {}", id)));
                }
                *id
            }
            GenerationTarget::New(generation) => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO generations (
                        user_id, source_id, reference_id, output_id,
                        model, elapsed_time, created_at, finished_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(generation.user_id)
                .bind(generation.source_id.get())
                .bind(generation.reference_id.get())
                .bind(audio_id.get())
                .bind(&output.model)
                .bind(output.elapsed_time)
                .bind(&finished_at)
                .bind(&finished_at)
                .execute(&mut *tx)
                .await?;

                GenerationId::new(result.last_insert_rowid())
            }
        };

        tx.commit().await?;

        debug!(
            generation_id = %generation_id,
            output_id = %audio_id,
            "Generation completed"
        );

        let audio = self.get_audio(audio_id).await?;
        let generation = self.get_generation(generation_id).await?;
        Ok((audio, generation))
    }

    /// Pending generations created before `now - older_than`
    pub async fn stale_pending(&self, older_than: chrono::Duration) -> Result<Vec<GenerationRecord>> {
        let cutoff = stale_cutoff(older_than)?;
        let sql = format!(
            "SELECT {} FROM generations WHERE output_id IS NULL AND created_at < ? ORDER BY id",
            GENERATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(GenerationRecord::from_row).collect()
    }

    /// Delete orphaned pending generations, returning how many were removed
    pub async fn delete_stale_pending(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = stale_cutoff(older_than)?;
        let result =
            sqlx::query("DELETE FROM generations WHERE output_id IS NULL AND created_at < ?")
                .bind(cutoff)
                .execute(self.pool())
                .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed = removed, "Deleted stale pending generations");
        }
        Ok(removed)
    }
}

/// Creation-time cutoff for the orphan sweep. A non-positive age would reach
/// rows whose messages are still in flight.
fn stale_cutoff(older_than: chrono::Duration) -> Result<String> {
    if older_than <= chrono::Duration::zero() {
        return Err(Error::InvalidInput(format!(
            "Stale age must be positive, got {}s",
            older_than.num_seconds()
        )));
    }
    Utc::now()
        .checked_sub_signed(older_than)
        .map(timestamp)
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "Stale age of {}s is out of range",
                older_than.num_seconds()
            ))
        })
}

//! Audio rows

use super::{parse_timestamp, timestamp, Ledger};
use crate::blob::BlobKey;
use crate::{AudioId, Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

/// Where an audio row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    Upload,
    Generation,
}

impl AudioSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioSource::Upload => "upload",
            AudioSource::Generation => "generation",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "upload" => Ok(AudioSource::Upload),
            "generation" => Ok(AudioSource::Generation),
            other => Err(Error::Internal(format!("Unknown audio source: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioRecord {
    pub id: AudioId,
    pub user_id: Option<i64>,
    pub name: String,
    pub source: AudioSource,
    pub blob_key: BlobKey,
    pub sample_rate: u32,
    pub num_frames: i64,
    pub available: bool,
    pub created_at: DateTime<Utc>,
}

/// Audio row to insert
#[derive(Debug, Clone)]
pub struct NewAudio {
    pub user_id: Option<i64>,
    pub name: String,
    pub source: AudioSource,
    pub blob_key: BlobKey,
    pub sample_rate: u32,
    pub num_frames: i64,
}

const AUDIO_COLUMNS: &str =
    "id, user_id, name, source, blob_key, sample_rate, num_frames, available, created_at";

impl AudioRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let source: String = row.get("source");
        let blob_key: String = row.get("blob_key");
        let sample_rate: i64 = row.get("sample_rate");
        let available: i64 = row.get("available");
        let created_at: String = row.get("created_at");

        Ok(Self {
            id: AudioId::new(row.get("id")),
            user_id: row.get("user_id"),
            name: row.get("name"),
            source: AudioSource::parse(&source)?,
            blob_key: BlobKey::parse(&blob_key)?,
            sample_rate: u32::try_from(sample_rate)
                .map_err(|_| Error::Internal(format!("Invalid sample rate {}", sample_rate)))?,
            num_frames: row.get("num_frames"),
            available: available != 0,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

/// Insert on an open connection or transaction, returning the new rowid
pub(crate) async fn insert_audio_on(conn: &mut SqliteConnection, audio: &NewAudio) -> Result<AudioId> {
    let result = sqlx::query(
        r#"
        INSERT INTO audio (user_id, name, source, blob_key, sample_rate, num_frames, available, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(audio.user_id)
    .bind(&audio.name)
    .bind(audio.source.as_str())
    .bind(audio.blob_key.as_str())
    .bind(audio.sample_rate as i64)
    .bind(audio.num_frames)
    .bind(timestamp(Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(AudioId::new(result.last_insert_rowid()))
}

impl Ledger {
    pub async fn insert_audio(&self, audio: &NewAudio) -> Result<AudioRecord> {
        let mut conn = self.pool().acquire().await?;
        let id = insert_audio_on(&mut conn, audio).await?;
        drop(conn);
        self.get_audio(id).await
    }

    pub async fn get_audio(&self, id: AudioId) -> Result<AudioRecord> {
        let sql = format!("SELECT {} FROM audio WHERE id = ?", AUDIO_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Audio {}", id)))?;

        AudioRecord::from_row(&row)
    }

    /// Fetch the source and reference rows of a generation in one query.
    /// The two ids may be equal.
    pub async fn get_audio_pair(
        &self,
        source: AudioId,
        reference: AudioId,
    ) -> Result<(AudioRecord, AudioRecord)> {
        let sql = format!("SELECT {} FROM audio WHERE id IN (?, ?)", AUDIO_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(source.get())
            .bind(reference.get())
            .fetch_all(self.pool())
            .await?;

        let records = rows
            .iter()
            .map(AudioRecord::from_row)
            .collect::<Result<Vec<_>>>()?;

        let find = |id: AudioId| {
            records
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("Audio {}", id)))
        };

        Ok((find(source)?, find(reference)?))
    }

    /// Whether any audio row points at `key`. Blobs are shared by content, so
    /// a blob may only be deleted once nothing references it.
    pub async fn blob_referenced(&self, key: &BlobKey) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audio WHERE blob_key = ?")
            .bind(key.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(count > 0)
    }
}

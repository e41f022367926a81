//! Test Helper Utilities
//!
//! Shared fixtures for the worker integration tests

#![allow(dead_code)]

pub mod audio_generator;
pub mod blobs;
pub mod models;

pub use audio_generator::{one_second_tone, sine_wav};
pub use blobs::CountingBlobStore;
pub use models::{FailingModel, SilenceModel};

use std::sync::Arc;
use std::time::Duration;
use voxshift_common::audio::AudioFormat;
use voxshift_common::blob::{BlobKey, BlobStore, MemoryBlobStore};
use voxshift_common::config::Device;
use voxshift_common::db::{AudioRecord, AudioSource, Ledger, NewAudio};
use voxshift_common::GenerationId;
use voxshift_worker::model::{ModelRunner, VoiceModel};

pub const MODEL_KEY: &str = "stub-silence";

pub fn model_format() -> AudioFormat {
    AudioFormat::new(16_000, 1)
}

/// In-memory ledger and blob store with a runner over `model`
pub struct TestEnv {
    pub ledger: Ledger,
    pub blobs: MemoryBlobStore,
    pub runner: ModelRunner,
}

impl TestEnv {
    pub async fn new(model: Arc<dyn VoiceModel>) -> Self {
        let blobs = MemoryBlobStore::new();
        Self::with_store(model, blobs.clone(), Arc::new(blobs)).await
    }

    /// Seed through `blobs` while the runner reads through `store`
    pub async fn with_store(
        model: Arc<dyn VoiceModel>,
        blobs: MemoryBlobStore,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let ledger = Ledger::in_memory().await.unwrap();
        let runner = ModelRunner::new(model, MODEL_KEY, Device::Cpu, model_format(), None, store);
        Self {
            ledger,
            blobs,
            runner,
        }
    }

    /// Store a one-second tone and its audio row. Each name gets its own
    /// frequency so blobs differ.
    pub async fn seed_audio(&self, name: &str, sample_rate: u32) -> AudioRecord {
        let spread: u32 = name.bytes().map(u32::from).sum::<u32>() % 50;
        let freq = 220.0 + 10.0 * spread as f32;
        let bytes = sine_wav(sample_rate, 1, 1.0, freq);
        let key = self.blobs.put(bytes).await.unwrap();
        self.insert_audio_row(name, key, sample_rate).await
    }

    /// Audio row whose blob is not decodable audio
    pub async fn seed_corrupt_audio(&self, name: &str) -> AudioRecord {
        let key = self.blobs.put(b"RIFF....not really".to_vec()).await.unwrap();
        self.insert_audio_row(name, key, 16_000).await
    }

    async fn insert_audio_row(&self, name: &str, key: BlobKey, sample_rate: u32) -> AudioRecord {
        self.ledger
            .insert_audio(&NewAudio {
                user_id: Some(1),
                name: name.to_string(),
                source: AudioSource::Upload,
                blob_key: key,
                sample_rate,
                num_frames: sample_rate as i64,
            })
            .await
            .unwrap()
    }

    /// Insert a pending generation with an explicit id, as the API would
    pub async fn seed_generation(
        &self,
        id: i64,
        source: &AudioRecord,
        reference: &AudioRecord,
    ) -> GenerationId {
        sqlx::query(
            "INSERT INTO generations (id, user_id, source_id, reference_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(1i64)
        .bind(source.id.get())
        .bind(reference.id.get())
        .bind(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .execute(self.ledger.pool())
        .await
        .unwrap();
        GenerationId::new(id)
    }

    /// Count of audio rows produced by generations
    pub async fn generated_audio_rows(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM audio WHERE source = 'generation'")
            .fetch_one(self.ledger.pool())
            .await
            .unwrap()
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

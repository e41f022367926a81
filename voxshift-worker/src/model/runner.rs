//! Model runner
//!
//! Owns the process-wide model and serializes every inference call behind one
//! lock. Loading inputs and saving outputs are ordinary async I/O and may
//! overlap freely; only [`ModelRunner::run_model`] is exclusive.

use super::backend::{loader_for, VoiceModel};
use super::store::ModelStore;
use crate::error::{Result, WorkerError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use voxshift_common::audio::{self, AudioBuffer, AudioFormat};
use voxshift_common::blob::{BlobKey, BlobStore};
use voxshift_common::config::{Device, Settings};
use voxshift_common::db::{
    AudioRecord, AudioSource, GenerationOutput, GenerationRecord, GenerationTarget, Ledger,
    NewAudio,
};

/// Shared handle to the loaded model. Cloning shares the model and its lock.
#[derive(Clone)]
pub struct ModelRunner {
    model: Arc<dyn VoiceModel>,
    model_key: String,
    device: Device,
    format: AudioFormat,
    sampling_steps: Option<u32>,
    exec_lock: Arc<Mutex<()>>,
    blobs: Arc<dyn BlobStore>,
}

impl ModelRunner {
    /// Resolve weights, pick a device and load the configured backend.
    /// Any failure here means the process must not serve.
    pub async fn initialize(settings: &Settings, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let worker = &settings.worker;
        let loader = loader_for(&worker.backend)?;

        let weights = if loader.requires_weights() {
            let store = ModelStore::from_settings(worker);
            Some(store.resolve(&worker.model_key).await?)
        } else {
            None
        };

        let device = worker.device.resolve();
        info!(
            model_key = %worker.model_key,
            backend = loader.name(),
            device = %device,
            "Loading model"
        );

        let started = Instant::now();
        let model = tokio::task::spawn_blocking(move || loader.load(weights.as_deref(), device))
            .await
            .map_err(|e| WorkerError::ModelLoad(format!("Model load task failed: {}", e)))?
            .map_err(|e| match e {
                WorkerError::ModelLoad(_) => e,
                other => WorkerError::ModelLoad(other.to_string()),
            })?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model ready"
        );

        Ok(Self::new(
            model,
            worker.model_key.clone(),
            device,
            AudioFormat::from(&settings.files.audio),
            worker.sampling_timesteps,
            blobs,
        ))
    }

    /// Wrap an already-loaded model
    pub fn new(
        model: Arc<dyn VoiceModel>,
        model_key: impl Into<String>,
        device: Device,
        format: AudioFormat,
        sampling_steps: Option<u32>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            model,
            model_key: model_key.into(),
            device,
            format,
            sampling_steps,
            exec_lock: Arc::new(Mutex::new(())),
            blobs,
        }
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Fetch and normalize both inputs concurrently
    pub async fn load_samples(
        &self,
        source: &AudioRecord,
        reference: &AudioRecord,
    ) -> Result<(AudioBuffer, AudioBuffer)> {
        tokio::try_join!(
            self.load_one(&source.blob_key),
            self.load_one(&reference.blob_key)
        )
    }

    async fn load_one(&self, key: &BlobKey) -> Result<AudioBuffer> {
        let bytes = self.blobs.get(key).await?;
        let format = self.format;
        let buffer = tokio::task::spawn_blocking(move || {
            audio::decode(&bytes).and_then(|decoded| audio::normalize(decoded, &format))
        })
        .await
        .map_err(join_failed)??;
        Ok(buffer)
    }

    /// Run one inference under the execution lock.
    ///
    /// Both buffers must already be in the model format. The lock guard moves
    /// into the blocking task, so it is held until inference really ends even
    /// if the caller stops waiting.
    pub async fn run_model(
        &self,
        source: AudioBuffer,
        reference: AudioBuffer,
    ) -> Result<(AudioBuffer, Duration)> {
        source.ensure_format(&self.format)?;
        reference.ensure_format(&self.format)?;

        let guard = self.exec_lock.clone().lock_owned().await;
        let model = self.model.clone();
        let steps = self.sampling_steps;

        let (samples, elapsed) = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let started = Instant::now();
            let output = model.convert(&source.samples, &reference.samples, steps);
            (output, started.elapsed())
        })
        .await
        .map_err(join_failed)?;

        let samples = samples?;
        if samples.is_empty() || samples.len() % self.format.channels as usize != 0 {
            return Err(WorkerError::Inference(format!(
                "Model produced {} samples for {} channels",
                samples.len(),
                self.format.channels
            )));
        }

        debug!(
            elapsed_ms = elapsed.as_millis() as u64,
            samples = samples.len(),
            "Inference finished"
        );
        Ok((AudioBuffer::new(samples, self.format), elapsed))
    }

    /// Encode and store the output, then write the output audio row and the
    /// generation row in one transaction. A blob stored for a failed
    /// transaction is removed again unless other rows share it.
    ///
    /// Workers sharing a blob store may discard the same content while this
    /// one commits. Each side checks again after its own write: the committer
    /// restores a blob that vanished, and the discarder restores one that
    /// gained a reference before its delete. Nothing else may delete blobs.
    pub async fn process_output(
        &self,
        ledger: &Ledger,
        target: GenerationTarget,
        source: &AudioRecord,
        reference: &AudioRecord,
        output: &AudioBuffer,
        elapsed: Duration,
    ) -> Result<(AudioRecord, GenerationRecord)> {
        let bytes = audio::encode_wav(output)?;
        let key = self.blobs.put(bytes.clone()).await?;

        let completion = GenerationOutput {
            target,
            audio: NewAudio {
                user_id: source.user_id,
                name: format!("{} to {}", source.name, reference.name),
                source: AudioSource::Generation,
                blob_key: key.clone(),
                sample_rate: output.format.sample_rate,
                num_frames: output.num_frames() as i64,
            },
            model: self.model_key.clone(),
            elapsed_time: elapsed.as_secs_f64(),
        };

        match ledger.complete_generation(&completion).await {
            Ok(rows) => {
                if !self.blobs.exists(&key).await? {
                    warn!(key = %key, "Output blob was discarded concurrently; storing it again");
                    self.blobs.put(bytes).await?;
                }
                Ok(rows)
            }
            Err(e) => {
                self.discard_blob(ledger, &key, bytes).await;
                Err(e.into())
            }
        }
    }

    async fn discard_blob(&self, ledger: &Ledger, key: &BlobKey, bytes: Vec<u8>) {
        match ledger.blob_referenced(key).await {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not check output blob references");
                return;
            }
        }

        if let Err(e) = self.blobs.delete(key).await {
            warn!(key = %key, error = %e, "Failed to delete orphaned output blob");
            return;
        }

        // An unknown answer counts as claimed
        let claimed = ledger.blob_referenced(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Could not recheck output blob references");
            true
        });
        if !claimed {
            debug!(key = %key, "Deleted orphaned output blob");
            return;
        }

        warn!(key = %key, "Output blob was claimed during cleanup; storing it again");
        if let Err(e) = self.blobs.put(bytes).await {
            warn!(key = %key, error = %e, "Failed to restore claimed output blob");
        }
    }
}

fn join_failed(e: JoinError) -> WorkerError {
    WorkerError::Inference(format!("Blocking task failed: {}", e))
}

//! Queue-driven worker loop
//!
//! Per message: `Received → Loading → Inferring → Saving → Acknowledged`, or
//! `Received → Failed` with the generation row deleted and the message left
//! unacknowledged. The queue's prefetch of one keeps a single message in
//! flight, so no two handlers ever write the same generation row.

use crate::error::{Result, WorkerError};
use crate::health::HealthResponse;
use crate::model::ModelRunner;
use crate::queue::MessageQueue;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use voxshift_common::blob::{BlobStore, FsBlobStore};
use voxshift_common::config::Settings;
use voxshift_common::db::{GenerationRecord, GenerationTarget, Ledger};
use voxshift_common::GenerationId;

/// Processing stage of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Loading,
    Inferring,
    Saving,
    Acknowledged,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Loading => "loading",
            Stage::Inferring => "inferring",
            Stage::Saving => "saving",
            Stage::Acknowledged => "acknowledged",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    not_found: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub not_found: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Worker {
    runner: ModelRunner,
    ledger: Ledger,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(runner: ModelRunner, ledger: Ledger) -> Self {
        Self {
            runner,
            ledger,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Process one generation. `Ok` means the message may be acknowledged.
    pub async fn handle(&self, id: GenerationId) -> Result<()> {
        WorkerStats::bump(&self.stats.received);
        info!(generation_id = %id, stage = %Stage::Received, "Generation received");

        let generation = match self.ledger.get_generation(id).await {
            Ok(generation) => generation,
            Err(e) if e.is_not_found() => {
                WorkerStats::bump(&self.stats.not_found);
                warn!(generation_id = %id, "Generation row missing; dropping message");
                return Err(WorkerError::GenerationNotFound(id));
            }
            Err(e) => {
                WorkerStats::bump(&self.stats.failed);
                return Err(e.into());
            }
        };

        // Redelivery of a finished generation
        if generation.is_complete() {
            info!(
                generation_id = %id,
                stage = %Stage::Acknowledged,
                "Generation already completed; acknowledging duplicate"
            );
            return Ok(());
        }

        let started = Instant::now();
        match self.process(&generation).await {
            Ok(()) => {
                WorkerStats::bump(&self.stats.completed);
                info!(
                    generation_id = %id,
                    stage = %Stage::Acknowledged,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Generation completed"
                );
                Ok(())
            }
            Err((stage, e)) => {
                WorkerStats::bump(&self.stats.failed);
                error!(
                    generation_id = %id,
                    stage = %stage,
                    error = %e,
                    "Generation failed; deleting request"
                );
                self.delete_orphan(id).await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        generation: &GenerationRecord,
    ) -> std::result::Result<(), (Stage, WorkerError)> {
        let id = generation.id;

        info!(generation_id = %id, stage = %Stage::Loading);
        let (source, reference) = self
            .ledger
            .get_audio_pair(generation.source_id, generation.reference_id)
            .await
            .map_err(|e| (Stage::Loading, e.into()))?;
        let (source_audio, reference_audio) = self
            .runner
            .load_samples(&source, &reference)
            .await
            .map_err(|e| (Stage::Loading, e))?;

        info!(generation_id = %id, stage = %Stage::Inferring);
        let (output, elapsed) = self
            .runner
            .run_model(source_audio, reference_audio)
            .await
            .map_err(|e| (Stage::Inferring, e))?;

        info!(generation_id = %id, stage = %Stage::Saving);
        self.runner
            .process_output(
                &self.ledger,
                GenerationTarget::Pending(id),
                &source,
                &reference,
                &output,
                elapsed,
            )
            .await
            .map_err(|e| (Stage::Saving, e))?;

        Ok(())
    }

    async fn delete_orphan(&self, id: GenerationId) {
        match self.ledger.delete_generation(id).await {
            Ok(true) => info!(generation_id = %id, stage = %Stage::Failed, "Deleted failed generation"),
            Ok(false) => {}
            Err(e) => warn!(generation_id = %id, error = %e, "Failed to delete failed generation"),
        }
    }

    /// Drain `queue` until cancelled or the connection is lost
    pub async fn run(&self, queue: &MessageQueue, cancel: &CancellationToken) -> Result<()> {
        queue.receive(|id| self.handle(id), cancel).await
    }
}

/// `GET /health` for worker mode
pub fn health_router(stats: Arc<WorkerStats>) -> Router {
    Router::new()
        .route("/health", get(worker_health))
        .with_state(stats)
}

async fn worker_health(State(stats): State<Arc<WorkerStats>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        stats: Some(stats.snapshot()),
        ..HealthResponse::ok()
    })
}

/// Run the queue consumer until `cancel` fires.
///
/// Queue connection, model load and ledger connection start concurrently and
/// any failure is fatal. The queue and ledger are closed on every exit path.
pub async fn run_worker(settings: Settings, cancel: CancellationToken) -> Result<()> {
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(&settings.files.root_dir).await?);
    let mut queue = MessageQueue::from_settings(&settings.worker)?;

    let started = tokio::try_join!(
        queue.initialize(),
        ModelRunner::initialize(&settings, blobs),
        async {
            Ledger::connect(&settings.database.path)
                .await
                .map_err(WorkerError::from)
        },
    );
    let (runner, ledger) = match started {
        Ok(((), runner, ledger)) => (runner, ledger),
        Err(e) => {
            queue.close().await;
            return Err(e);
        }
    };

    info!(
        queue = %queue.kind(),
        model_key = %runner.model_key(),
        soft_time_limit = settings.worker.soft_time_limit,
        max_retries = settings.worker.max_retries,
        "Worker started"
    );

    let worker = Worker::new(runner, ledger.clone());
    let health_cancel = cancel.child_token();
    let health = match settings.worker.health_port {
        Some(port) => {
            match tokio::net::TcpListener::bind((settings.server.host.as_str(), port)).await {
                Ok(listener) => {
                    info!("Health check: http://{}:{}/health", settings.server.host, port);
                    let app = health_router(worker.stats());
                    let shutdown = health_cancel.clone();
                    Some(tokio::spawn(async move {
                        axum::serve(listener, app)
                            .with_graceful_shutdown(async move { shutdown.cancelled().await })
                            .await
                    }))
                }
                Err(e) => {
                    queue.close().await;
                    ledger.close().await;
                    return Err(WorkerError::Connection(format!(
                        "Cannot bind health port {}: {}",
                        port, e
                    )));
                }
            }
        }
        None => None,
    };

    let result = worker.run(&queue, &cancel).await;
    if let Err(e) = &result {
        error!(error = %e, "Receive loop ended");
    }

    health_cancel.cancel();
    if let Some(handle) = health {
        if let Ok(Err(e)) = handle.await {
            warn!(error = %e, "Health server error");
        }
    }
    queue.close().await;
    ledger.close().await;
    info!(stats = ?worker.stats().snapshot(), "Worker stopped");

    result
}

//! Dispatch server
//!
//! Pull-based alternative to the queue consumer: an HTTP endpoint in front of
//! the same load → infer → save steps, exposing its queue depth so a reverse
//! proxy can route by load.

pub mod api;
pub mod error;
pub mod pipeline;

pub use api::build_router;
pub use error::DispatchError;
pub use pipeline::{Completed, Pipeline, PipelineWorkers};

use crate::error::{Result, WorkerError};
use crate::model::ModelRunner;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use voxshift_common::blob::{BlobStore, FsBlobStore};
use voxshift_common::config::Settings;
use voxshift_common::db::Ledger;

/// Start everything from configuration and serve until `shutdown` fires.
///
/// Ledger connection, model load and TCP bind happen concurrently.
pub async fn run_server(settings: Settings, shutdown: CancellationToken) -> Result<()> {
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(&settings.files.root_dir).await?);
    let address = format!("{}:{}", settings.server.host, settings.server.port);

    let (runner, ledger, listener) = tokio::try_join!(
        ModelRunner::initialize(&settings, blobs),
        async {
            Ledger::connect(&settings.database.path)
                .await
                .map_err(WorkerError::from)
        },
        async {
            TcpListener::bind(&address).await.map_err(|e| {
                WorkerError::Connection(format!("Cannot bind {}: {}", address, e))
            })
        },
    )?;

    info!("Dispatch server listening on http://{}", address);
    info!("Health check: http://{}/health", address);

    serve(
        listener,
        runner,
        ledger,
        settings.server.max_loaded_requests,
        shutdown,
    )
    .await
}

/// Serve on an already-bound listener.
///
/// On exit the listener stops accepting, in-flight requests drain, the stage
/// tasks are aborted and awaited, and the ledger is closed. This runs on every
/// exit path, including a serve error.
pub async fn serve(
    listener: TcpListener,
    runner: ModelRunner,
    ledger: Ledger,
    max_loaded: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let (pipeline, workers) = Pipeline::start(runner, ledger.clone(), max_loaded);
    let app = build_router(pipeline);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    workers.shutdown().await;
    ledger.close().await;
    info!("Dispatch server stopped");

    result.map_err(WorkerError::from)
}

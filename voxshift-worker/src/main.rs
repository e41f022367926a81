//! voxshift-worker - Voice conversion job dispatch
//!
//! Runs either as a queue consumer (`worker`) or as an HTTP dispatch server
//! (`serve`), plus a few operational commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxshift_common::config::Settings;
use voxshift_common::db::Ledger;
use voxshift_common::{AudioId, GenerationId};
use voxshift_worker::bench::{self, BenchTarget};
use voxshift_worker::model::ModelStore;
use voxshift_worker::queue::MessageQueue;
use voxshift_worker::{server, worker};

#[derive(Parser, Debug)]
#[command(name = "voxshift-worker")]
#[command(about = "Voice conversion worker and dispatch server")]
#[command(version)]
struct Args {
    /// Path to config.toml
    #[arg(short, long, global = true, env = "VOXSHIFT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume generation requests from the configured queue
    Worker,

    /// Serve generation requests over HTTP
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Publish a generation id to the configured queue
    Enqueue { id: GenerationId },

    /// Download and verify model weights
    FetchModel {
        /// Model key (defaults to the configured one)
        #[arg(long)]
        key: Option<String>,
    },

    /// Call a dispatch server concurrently and watch its queue depth
    Bench {
        num_times: usize,

        #[arg(long)]
        source_id: AudioId,

        #[arg(long)]
        reference_id: AudioId,

        #[arg(short = 't', long, default_value = "localhost")]
        host: String,

        #[arg(short, long, default_value = "8080")]
        port: u16,

        #[arg(short, long, default_value = "http")]
        scheme: String,
    },

    /// Delete pending generations older than the given age
    Sweep {
        /// Age in seconds
        #[arg(long, default_value = "3600", value_parser = clap::value_parser!(u64).range(1..))]
        older_than: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;

    init_tracing(&settings.logging.level);

    info!(
        "Starting voxshift-worker v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    match args.command {
        Command::Worker => {
            let cancel = shutdown_token();
            worker::run_worker(settings, cancel)
                .await
                .context("Worker failed")?;
        }
        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            let cancel = shutdown_token();
            server::run_server(settings, cancel)
                .await
                .context("Dispatch server failed")?;
        }
        Command::Enqueue { id } => {
            let mut queue = MessageQueue::from_settings(&settings.worker)?;
            queue.initialize().await.context("Failed to connect to queue")?;
            let sent = queue.send(id).await;
            queue.close().await;
            sent.context("Failed to enqueue generation")?;
            info!(generation_id = %id, queue = %queue.kind(), "Enqueued");
        }
        Command::FetchModel { key } => {
            let key = key.unwrap_or_else(|| settings.worker.model_key.clone());
            let path = ModelStore::from_settings(&settings.worker)
                .fetch(&key)
                .await
                .context("Failed to fetch model")?;
            info!("Model weights at {}", path.display());
        }
        Command::Bench {
            num_times,
            source_id,
            reference_id,
            host,
            port,
            scheme,
        } => {
            let target = BenchTarget { scheme, host, port };
            let summary = bench::call_server(&target, num_times, source_id, reference_id).await;
            if summary.failed > 0 {
                anyhow::bail!("{} of {} requests failed", summary.failed, num_times);
            }
        }
        Command::Sweep { older_than } => {
            let age = sweep_age(older_than)?;
            let ledger = Ledger::connect(&settings.database.path).await?;
            let removed = ledger.delete_stale_pending(age).await;
            ledger.close().await;
            info!("Removed {} stale pending generations", removed?);
        }
    }

    Ok(())
}

/// Convert a `--older-than` value, refusing ages chrono cannot represent
fn sweep_age(seconds: u64) -> Result<chrono::Duration> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("--older-than {} is out of range", seconds))
}

/// `RUST_LOG` wins; otherwise the configured level for our crates and quiet
/// dependencies.
fn init_tracing(level: &str) {
    let default_filter = format!(
        "voxshift_worker={level},voxshift_common={level},tower_http=warn,lapin=warn,aws_config=warn,aws_smithy_runtime=warn",
        level = level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Token cancelled on Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("voxshift-worker").chain(args.iter().copied()))
    }

    #[test]
    fn sweep_age_must_be_positive() {
        for bad in ["0", "-60", "soon"] {
            assert!(parse(&["sweep", "--older-than", bad]).is_err(), "{}", bad);
        }

        match parse(&["sweep"]).unwrap().command {
            Command::Sweep { older_than } => assert_eq!(older_than, 3600),
            other => panic!("unexpected command {:?}", other),
        }
        match parse(&["sweep", "--older-than", "90"]).unwrap().command {
            Command::Sweep { older_than } => assert_eq!(older_than, 90),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn sweep_age_rejects_unrepresentable_values() {
        assert_eq!(sweep_age(90).unwrap(), chrono::Duration::seconds(90));
        assert!(sweep_age(u64::MAX).is_err());
        assert!(sweep_age(i64::MAX as u64).is_err());
    }
}

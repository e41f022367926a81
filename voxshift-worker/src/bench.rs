//! Load generator for a running dispatch server
//!
//! Fires `n` concurrent generation requests and logs the server's queue depth
//! once a second until they all return.

use futures::future::join_all;
use std::time::{Duration, Instant};
use tracing::{error, info};
use voxshift_common::AudioId;

#[derive(Debug, Clone)]
pub struct BenchTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl BenchTarget {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BenchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

pub async fn call_server(
    target: &BenchTarget,
    num_times: usize,
    source_id: AudioId,
    reference_id: AudioId,
) -> BenchSummary {
    let client = reqwest::Client::new();
    let base = target.base_url();
    let started = Instant::now();

    let monitor = tokio::spawn(log_queue_size(client.clone(), format!("{}/queue", base)));

    let url = format!("{}/", base);
    let calls = (0..num_times).map(|_| call_once(&client, &url, source_id, reference_id));
    let results = join_all(calls).await;
    monitor.abort();

    let succeeded = results.iter().filter(|ok| **ok).count();
    let summary = BenchSummary {
        succeeded,
        failed: results.len() - succeeded,
    };
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Benchmark finished"
    );
    summary
}

async fn call_once(
    client: &reqwest::Client,
    url: &str,
    source_id: AudioId,
    reference_id: AudioId,
) -> bool {
    let response = client
        .get(url)
        .query(&[
            ("source_id", source_id.to_string()),
            ("reference_id", reference_id.to_string()),
        ])
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            let body = response.text().await.unwrap_or_default();
            info!("Response: {}", body);
            true
        }
        Ok(response) => {
            error!("Request failed with status {}", response.status());
            false
        }
        Err(e) => {
            error!("Request failed: {}", e);
            false
        }
    }
}

async fn log_queue_size(client: reqwest::Client, url: String) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let depth = response.text().await.unwrap_or_default();
                info!("Queue size: {}", depth.trim());
            }
            Ok(response) => {
                error!("Queue probe failed with status {}", response.status());
                return;
            }
            Err(e) => {
                error!("Queue probe failed: {}", e);
                return;
            }
        }
    }
}

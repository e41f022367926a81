//! Health check document shared by worker and dispatch server

use serde::{Deserialize, Serialize};

use crate::worker::StatsSnapshot;

pub const MODULE_NAME: &str = "voxshift-worker";

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    /// Present in queue-consumer mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
    /// Present in dispatch-server mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            module: MODULE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            stats: None,
            queue_size: None,
        }
    }
}

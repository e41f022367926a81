//! No-op queue for deployments without a broker

use crate::error::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct NullQueue;

impl NullQueue {
    pub(super) fn send(&self, body: &[u8]) {
        debug!(bytes = body.len(), "Null queue discarded message");
    }

    /// Never delivers anything
    pub(super) async fn receive(&self, cancel: &CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

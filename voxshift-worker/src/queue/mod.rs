//! Message queue abstraction
//!
//! One interface over every broker backend. The backend is picked from
//! configuration at startup ([`MessageQueue::from_settings`]) and never
//! inspected afterwards.
//!
//! Delivery contract shared by all backends:
//! - bodies are the decimal generation id ([`wire`])
//! - at most one message is in flight per consumer
//! - a message is acknowledged only when the handler returns `Ok`; handler
//!   errors and undecodable bodies leave it to the broker's redelivery policy
//! - cancellation returns from `receive` immediately, even mid-handler, and the
//!   in-flight message is neither acked nor rejected

pub mod memory;
pub mod null;
#[cfg(feature = "rabbit")]
pub mod rabbit;
#[cfg(feature = "sqs")]
pub mod sqs;
pub mod wire;

pub use memory::MemoryQueue;
pub use null::NullQueue;
#[cfg(feature = "rabbit")]
pub use rabbit::RabbitQueue;
#[cfg(feature = "sqs")]
pub use sqs::SqsQueue;

use crate::error::{Result, WorkerError};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use voxshift_common::config::{QueueKind, WorkerSettings};
use voxshift_common::GenerationId;

/// What to do with a message once its handler has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the queue
    Ack,
    /// Leave for broker-level redelivery or dead-lettering
    Retain,
}

impl Disposition {
    pub fn from_outcome<T, E>(outcome: &std::result::Result<T, E>) -> Self {
        match outcome {
            Ok(_) => Disposition::Ack,
            Err(_) => Disposition::Retain,
        }
    }
}

/// A configured queue backend
pub enum MessageQueue {
    #[cfg(feature = "rabbit")]
    Rabbit(RabbitQueue),
    #[cfg(feature = "sqs")]
    Sqs(SqsQueue),
    Memory(MemoryQueue),
    Null(NullQueue),
}

impl MessageQueue {
    /// Build the backend named by `settings.queue_type`. No I/O happens until
    /// [`initialize`](Self::initialize).
    pub fn from_settings(settings: &WorkerSettings) -> Result<Self> {
        match settings.queue_type {
            #[cfg(feature = "rabbit")]
            QueueKind::Rabbit => Ok(Self::Rabbit(RabbitQueue::new(settings.rabbit.clone()))),
            #[cfg(feature = "sqs")]
            QueueKind::Sqs => Ok(Self::Sqs(SqsQueue::new(settings.sqs.clone()))),
            QueueKind::Memory => Ok(Self::Memory(MemoryQueue::new(Duration::from_millis(
                settings.memory.visibility_timeout_ms,
            )))),
            QueueKind::Dummy => Ok(Self::Null(NullQueue)),
            #[allow(unreachable_patterns)]
            other => Err(WorkerError::Connection(format!(
                "Queue backend {} is not compiled into this binary",
                other
            ))),
        }
    }

    pub fn kind(&self) -> QueueKind {
        match self {
            #[cfg(feature = "rabbit")]
            Self::Rabbit(_) => QueueKind::Rabbit,
            #[cfg(feature = "sqs")]
            Self::Sqs(_) => QueueKind::Sqs,
            Self::Memory(_) => QueueKind::Memory,
            Self::Null(_) => QueueKind::Dummy,
        }
    }

    /// Connect to the broker and declare the queue. Calling again on an open
    /// connection does nothing. Failure is fatal to startup.
    pub async fn initialize(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "rabbit")]
            Self::Rabbit(q) => q.initialize().await,
            #[cfg(feature = "sqs")]
            Self::Sqs(q) => q.initialize().await,
            Self::Memory(_) | Self::Null(_) => Ok(()),
        }
    }

    /// Release the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        match self {
            #[cfg(feature = "rabbit")]
            Self::Rabbit(q) => q.close().await,
            #[cfg(feature = "sqs")]
            Self::Sqs(q) => q.close(),
            Self::Memory(_) | Self::Null(_) => {}
        }
    }

    pub async fn send(&self, id: GenerationId) -> Result<()> {
        let body = wire::encode(id);
        match self {
            #[cfg(feature = "rabbit")]
            Self::Rabbit(q) => q.send(&body).await?,
            #[cfg(feature = "sqs")]
            Self::Sqs(q) => q.send(&body).await?,
            Self::Memory(q) => q.send_raw(body),
            Self::Null(q) => q.send(&body),
        }
        debug!(generation_id = %id, queue = %self.kind(), "Enqueued generation");
        Ok(())
    }

    /// Consume messages until `cancel` fires (returns `Ok`) or the
    /// connection is lost (returns `Err`). Handler errors never end the loop.
    pub async fn receive<F, Fut, E>(&self, handler: F, cancel: &CancellationToken) -> Result<()>
    where
        F: FnMut(GenerationId) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Display,
    {
        match self {
            #[cfg(feature = "rabbit")]
            Self::Rabbit(q) => q.receive(handler, cancel).await,
            #[cfg(feature = "sqs")]
            Self::Sqs(q) => q.receive(handler, cancel).await,
            Self::Memory(q) => q.receive(handler, cancel).await,
            Self::Null(q) => q.receive(cancel).await,
        }
    }
}

/// Decode a body, run the handler and decide the message's fate.
/// `None` means cancellation won the race and the message must be left alone.
pub(crate) async fn process_delivery<F, Fut, E>(
    body: &[u8],
    handler: &mut F,
    cancel: &CancellationToken,
) -> Option<Disposition>
where
    F: FnMut(GenerationId) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: Display,
{
    let id = match wire::decode(body) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Discarding undecodable message without acknowledging it");
            return Some(Disposition::Retain);
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(generation_id = %id, "Cancelled while handling message");
            return None;
        }
        outcome = handler(id) => outcome,
    };

    if let Err(e) = &outcome {
        error!(generation_id = %id, error = %e, "Message handler failed; message left unacknowledged");
    }
    Some(Disposition::from_outcome(&outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxshift_common::config::WorkerSettings;

    #[test]
    fn disposition_follows_outcome() {
        assert_eq!(Disposition::from_outcome::<(), ()>(&Ok(())), Disposition::Ack);
        assert_eq!(Disposition::from_outcome::<(), &str>(&Err("boom")), Disposition::Retain);
    }

    #[test]
    fn backend_is_selected_by_configuration() {
        let mut settings = WorkerSettings::default();
        settings.queue_type = QueueKind::Dummy;
        assert_eq!(MessageQueue::from_settings(&settings).unwrap().kind(), QueueKind::Dummy);

        settings.queue_type = QueueKind::Memory;
        assert_eq!(MessageQueue::from_settings(&settings).unwrap().kind(), QueueKind::Memory);
    }

    #[tokio::test]
    async fn cancellation_preempts_a_running_handler() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut handler = |_id: GenerationId| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                std::future::pending::<()>().await;
                Ok::<(), String>(())
            }
        };

        assert_eq!(process_delivery(b"5", &mut handler, &cancel).await, None);
    }

    #[tokio::test]
    async fn undecodable_body_is_retained_without_calling_handler() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let mut handler = |_id: GenerationId| {
            calls += 1;
            async { Ok::<(), String>(()) }
        };

        let disposition = process_delivery(b"not-an-id", &mut handler, &cancel).await;
        assert_eq!(disposition, Some(Disposition::Retain));
        assert_eq!(calls, 0);
    }
}

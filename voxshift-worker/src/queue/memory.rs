//! In-process queue
//!
//! Behaves like a visibility-timeout broker: a received message becomes
//! invisible, acknowledging deletes it, and a message left unacknowledged
//! becomes visible again once the timeout passes. Clones share one queue.

use super::{process_delivery, Disposition};
use crate::error::Result;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voxshift_common::GenerationId;

use super::wire;

#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

/// Acknowledged bodies kept for inspection; older ones are only counted
const ACKED_HISTORY: usize = 1024;

#[derive(Default)]
struct State {
    next_tag: u64,
    messages: Vec<Entry>,
    acked: VecDeque<Vec<u8>>,
    acked_total: u64,
    deliveries: u64,
}

struct Entry {
    tag: u64,
    body: Vec<u8>,
    visible_at: Instant,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                visibility_timeout,
            }),
        }
    }

    /// Enqueue an arbitrary body, bypassing the id encoding
    pub fn send_raw(&self, body: Vec<u8>) {
        {
            let mut state = self.lock();
            let tag = state.next_tag;
            state.next_tag += 1;
            state.messages.push(Entry {
                tag,
                body,
                visible_at: Instant::now(),
            });
        }
        self.inner.notify.notify_one();
    }

    /// Messages not yet acknowledged, visible or not
    pub fn pending(&self) -> usize {
        self.lock().messages.len()
    }

    /// Most recently acknowledged ids, oldest first
    pub fn acked(&self) -> Vec<GenerationId> {
        self.lock()
            .acked
            .iter()
            .filter_map(|body| wire::decode(body).ok())
            .collect()
    }

    /// Messages acknowledged since creation
    pub fn acked_count(&self) -> u64 {
        self.lock().acked_total
    }

    /// Total deliveries, counting redeliveries
    pub fn deliveries(&self) -> u64 {
        self.lock().deliveries
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the oldest visible message and hide it for the visibility
    /// timeout. Otherwise report when the next hidden one reappears.
    fn poll(&self) -> std::result::Result<(u64, Vec<u8>), Option<Instant>> {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(entry) = state.messages.iter_mut().find(|e| e.visible_at <= now) {
            entry.visible_at = now + self.inner.visibility_timeout;
            let delivery = (entry.tag, entry.body.clone());
            state.deliveries += 1;
            return Ok(delivery);
        }

        Err(state.messages.iter().map(|e| e.visible_at).min())
    }

    fn ack(&self, tag: u64) {
        let mut state = self.lock();
        if let Some(pos) = state.messages.iter().position(|e| e.tag == tag) {
            let entry = state.messages.remove(pos);
            if state.acked.len() == ACKED_HISTORY {
                state.acked.pop_front();
            }
            state.acked.push_back(entry.body);
            state.acked_total += 1;
        }
    }

    pub(super) async fn receive<F, Fut, E>(
        &self,
        mut handler: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: FnMut(GenerationId) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Display,
    {
        loop {
            let (tag, body) = match self.poll() {
                Ok(delivery) => delivery,
                Err(next_visible) => {
                    let wake = async {
                        match next_visible {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = self.inner.notify.notified() => {}
                        _ = wake => {}
                    }
                    continue;
                }
            };

            match process_delivery(&body, &mut handler, cancel).await {
                None => return Ok(()),
                Some(Disposition::Ack) => self.ack(tag),
                Some(Disposition::Retain) => {
                    debug!(tag = tag, "Message retained until visibility timeout");
                }
            }
        }
    }
}

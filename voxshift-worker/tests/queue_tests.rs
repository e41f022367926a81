//! Queue abstraction tests over the in-process backends

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voxshift_common::config::{QueueKind, WorkerSettings};
use voxshift_common::GenerationId;
use voxshift_worker::queue::{MemoryQueue, MessageQueue};

/// Handler that records every id, fails the ids in `failing`, and cancels
/// once `stop_after` deliveries have been seen.
fn recording_handler(
    seen: Arc<Mutex<Vec<GenerationId>>>,
    failing: Vec<i64>,
    stop_after: usize,
    cancel: CancellationToken,
) -> impl FnMut(GenerationId) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
{
    move |id| {
        let seen = seen.clone();
        let failing = failing.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            let count = {
                let mut seen = seen.lock().unwrap();
                seen.push(id);
                seen.len()
            };
            if count >= stop_after {
                cancel.cancel();
            }
            if failing.contains(&id.get()) {
                Err(format!("generation {} failed", id))
            } else {
                Ok(())
            }
        })
    }
}

#[tokio::test]
async fn memory_queue_acknowledges_successes_only() {
    let memory = MemoryQueue::new(Duration::from_secs(60));
    let queue = MessageQueue::Memory(memory.clone());
    for id in [1, 2, 3] {
        queue.send(GenerationId::new(id)).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = recording_handler(seen.clone(), vec![2], 3, cancel.clone());

    tokio::time::timeout(Duration::from_secs(5), queue.receive(handler, &cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![GenerationId::new(1), GenerationId::new(2), GenerationId::new(3)]
    );
    // A handler that completes settles its message even if it cancelled
    assert_eq!(memory.acked(), vec![GenerationId::new(1), GenerationId::new(3)]);
    assert_eq!(memory.pending(), 1);
}

#[tokio::test]
async fn undecodable_body_is_skipped_and_left_unacknowledged() {
    let memory = MemoryQueue::new(Duration::from_secs(60));
    memory.send_raw(b"forty-two".to_vec());
    memory.send_raw(b"".to_vec());
    let queue = MessageQueue::Memory(memory.clone());
    queue.send(GenerationId::new(42)).await.unwrap();

    let cancel = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = recording_handler(seen.clone(), vec![], 1, cancel.clone());

    tokio::time::timeout(Duration::from_secs(5), queue.receive(handler, &cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![GenerationId::new(42)]);
    assert_eq!(memory.deliveries(), 3);
    assert_eq!(memory.acked(), vec![GenerationId::new(42)]);
    assert_eq!(memory.pending(), 2);
}

#[tokio::test]
async fn idle_null_queue_returns_on_cancel() {
    let mut settings = WorkerSettings::default();
    settings.queue_type = QueueKind::Dummy;
    let mut queue = MessageQueue::from_settings(&settings).unwrap();
    queue.initialize().await.unwrap();
    queue.send(GenerationId::new(1)).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let handler = |_id: GenerationId| async { Err::<(), _>("never delivered") };
    tokio::time::timeout(Duration::from_secs(5), queue.receive(handler, &cancel))
        .await
        .unwrap()
        .unwrap();

    queue.close().await;
    queue.close().await;
}

#[tokio::test]
async fn memory_queue_from_settings_uses_configured_visibility() {
    let mut settings = WorkerSettings::default();
    settings.queue_type = QueueKind::Memory;
    settings.memory.visibility_timeout_ms = 30;
    let queue = MessageQueue::from_settings(&settings).unwrap();
    queue.send(GenerationId::new(8)).await.unwrap();

    let cancel = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    // Fail every delivery; the second one only happens after the timeout
    let handler = recording_handler(seen.clone(), vec![8], 2, cancel.clone());

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), queue.receive(handler, &cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

//! Queue-driven worker integration tests
//!
//! In-memory queue, ledger and blob store with stub models standing in for
//! real inference.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use helpers::{wait_until, FailingModel, SilenceModel, TestEnv, MODEL_KEY};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use voxshift_common::audio::{AudioBuffer, AudioFormat};
use voxshift_common::blob::BlobStore;
use voxshift_common::GenerationId;
use voxshift_worker::health::HealthResponse;
use voxshift_worker::queue::{MemoryQueue, MessageQueue};
use voxshift_worker::worker::{health_router, Worker};
use voxshift_worker::WorkerError;

#[tokio::test]
async fn end_to_end_generation_42() {
    let model = SilenceModel::new(Duration::from_millis(5), 8_000);
    let env = TestEnv::new(model.clone()).await;
    // Both inputs are resampled to the model rate
    let source = env.seed_audio("source-tone", 44_100).await;
    let reference = env.seed_audio("reference-tone", 22_050).await;
    let id = env.seed_generation(42, &source, &reference).await;

    let memory = MemoryQueue::new(Duration::from_millis(50));
    let queue = MessageQueue::Memory(memory.clone());
    queue.send(id).await.unwrap();

    let worker = Arc::new(Worker::new(env.runner.clone(), env.ledger.clone()));
    let cancel = CancellationToken::new();
    let consumer = {
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(&queue, &cancel).await })
    };

    let acked = wait_until(Duration::from_secs(10), || {
        let memory = memory.clone();
        async move { memory.acked() == vec![GenerationId::new(42)] }
    })
    .await;
    assert!(acked, "generation 42 was never acknowledged");

    // Wait past the visibility timeout: an acked message must not come back
    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    consumer.await.unwrap().unwrap();

    assert_eq!(memory.deliveries(), 1);
    assert_eq!(memory.pending(), 0);
    assert_eq!(model.calls(), 1);

    let generation = env.ledger.get_generation(id).await.unwrap();
    let output_id = generation.output_id.expect("output must be set");
    assert!(generation.elapsed_time.unwrap() > 0.0);
    assert_eq!(generation.model.as_deref(), Some(MODEL_KEY));
    assert!(generation.finished_at.is_some());

    let output = env.ledger.get_audio(output_id).await.unwrap();
    assert_eq!(output.name, "source-tone to reference-tone");
    assert_eq!(output.sample_rate, 16_000);
    assert_eq!(output.num_frames, 8_000);
    assert!(env.blobs.contains(&output.blob_key));

    let stats = worker.stats().snapshot();
    assert_eq!((stats.received, stats.completed, stats.failed), (1, 1, 0));
}

#[tokio::test]
async fn missing_generation_99_is_dropped_and_worker_stays_healthy() {
    let env = TestEnv::new(SilenceModel::new(Duration::from_millis(1), 1_600)).await;
    let source = env.seed_audio("a", 16_000).await;
    let reference = env.seed_audio("b", 16_000).await;
    let good = env.seed_generation(7, &source, &reference).await;

    let memory = MemoryQueue::new(Duration::from_secs(60));
    let queue = MessageQueue::Memory(memory.clone());
    queue.send(GenerationId::new(99)).await.unwrap();
    queue.send(good).await.unwrap();

    let worker = Arc::new(Worker::new(env.runner.clone(), env.ledger.clone()));
    let cancel = CancellationToken::new();
    let consumer = {
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(&queue, &cancel).await })
    };

    let done = wait_until(Duration::from_secs(10), || {
        let memory = memory.clone();
        async move { memory.acked() == vec![GenerationId::new(7)] }
    })
    .await;
    assert!(done, "worker stopped consuming after the missing generation");
    assert!(!consumer.is_finished());

    // Health probe still answers, and reports the drop
    let response = health_router(worker.stats())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "ok");
    let stats = health.stats.unwrap();
    assert_eq!(stats.not_found, 1);
    assert_eq!(stats.completed, 1);

    // The unknown id stays unacknowledged for the broker to expire
    assert_eq!(memory.pending(), 1);

    cancel.cancel();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_inference_deletes_the_orphaned_request() {
    let env = TestEnv::new(Arc::new(FailingModel)).await;
    let source = env.seed_audio("a", 16_000).await;
    let reference = env.seed_audio("b", 16_000).await;
    let id = env.seed_generation(5, &source, &reference).await;

    let worker = Worker::new(env.runner.clone(), env.ledger.clone());
    let err = worker.handle(id).await.unwrap_err();
    assert!(matches!(err, WorkerError::Inference(_)));

    assert!(env.ledger.get_generation(id).await.unwrap_err().is_not_found());
    assert_eq!(env.generated_audio_rows().await, 0);
    assert_eq!(worker.stats().snapshot().failed, 1);

    // Redelivery of the failed message now takes the not-found path
    let err = worker.handle(id).await.unwrap_err();
    assert!(matches!(err, WorkerError::GenerationNotFound(g) if g == id));
}

#[tokio::test]
async fn undecodable_input_fails_in_loading_and_cleans_up() {
    let model = SilenceModel::new(Duration::from_millis(1), 1_600);
    let env = TestEnv::new(model.clone()).await;
    let source = env.seed_corrupt_audio("broken").await;
    let reference = env.seed_audio("ok", 16_000).await;
    let id = env.seed_generation(11, &source, &reference).await;

    let memory = MemoryQueue::new(Duration::from_secs(60));
    let queue = MessageQueue::Memory(memory.clone());
    queue.send(id).await.unwrap();

    let worker = Arc::new(Worker::new(env.runner.clone(), env.ledger.clone()));
    let cancel = CancellationToken::new();
    let consumer = {
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(&queue, &cancel).await })
    };

    let failed = wait_until(Duration::from_secs(10), || {
        let worker = worker.clone();
        async move { worker.stats().snapshot().failed == 1 }
    })
    .await;
    assert!(failed);
    cancel.cancel();
    consumer.await.unwrap().unwrap();

    assert_eq!(model.calls(), 0);
    assert!(env.ledger.get_generation(id).await.is_err());
    assert!(memory.acked().is_empty());
    assert_eq!(memory.pending(), 1);
}

#[tokio::test]
async fn redelivery_of_completed_generation_is_acknowledged_without_rerun() {
    let model = SilenceModel::new(Duration::from_millis(1), 1_600);
    let env = TestEnv::new(model.clone()).await;
    let source = env.seed_audio("a", 16_000).await;
    let reference = env.seed_audio("b", 16_000).await;
    let id = env.seed_generation(42, &source, &reference).await;

    let worker = Worker::new(env.runner.clone(), env.ledger.clone());
    worker.handle(id).await.unwrap();
    let first = env.ledger.get_generation(id).await.unwrap();

    // Same id delivered again
    worker.handle(id).await.unwrap();

    assert_eq!(model.calls(), 1);
    assert_eq!(env.generated_audio_rows().await, 1);
    assert_eq!(env.ledger.get_generation(id).await.unwrap(), first);
}

#[tokio::test]
async fn concurrent_runs_never_overlap_inference() {
    let model = SilenceModel::new(Duration::from_millis(20), 160);
    let env = TestEnv::new(model.clone()).await;
    let format = AudioFormat::new(16_000, 1);

    let runs = (0..6).map(|_| {
        let runner = env.runner.clone();
        let buffer = AudioBuffer::new(vec![0.1; 1_600], format);
        tokio::spawn(async move { runner.run_model(buffer.clone(), buffer).await })
    });
    for run in futures::future::join_all(runs).await {
        let (_, elapsed) = run.unwrap().unwrap();
        assert!(elapsed >= Duration::from_millis(20));
    }

    assert_eq!(model.calls(), 6);
    assert_eq!(model.intervals().len(), 6);
    assert_eq!(model.overlap_count(), 0);
}

#[tokio::test]
async fn process_output_keeps_shared_blob_when_transaction_fails() {
    let env = TestEnv::new(SilenceModel::new(Duration::from_millis(1), 1_600)).await;
    let source = env.seed_audio("a", 16_000).await;
    let reference = env.seed_audio("b", 16_000).await;
    let first = env.seed_generation(1, &source, &reference).await;

    let output = AudioBuffer::new(vec![0.0; 1_600], AudioFormat::new(16_000, 1));
    let (audio, _) = env
        .runner
        .process_output(
            &env.ledger,
            voxshift_common::db::GenerationTarget::Pending(first),
            &source,
            &reference,
            &output,
            Duration::from_millis(3),
        )
        .await
        .unwrap();

    // Completing a missing row fails; the identical output blob is still
    // referenced by the first generation and must survive
    let err = env
        .runner
        .process_output(
            &env.ledger,
            voxshift_common::db::GenerationTarget::Pending(GenerationId::new(404)),
            &source,
            &reference,
            &output,
            Duration::from_millis(3),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Common(ref e) if e.is_not_found()));
    assert!(env.blobs.get(&audio.blob_key).await.is_ok());

    // A unique output with no other reference is removed
    let unique = AudioBuffer::new(vec![0.25; 1_600], AudioFormat::new(16_000, 1));
    let before = env.blobs.len();
    env.runner
        .process_output(
            &env.ledger,
            voxshift_common::db::GenerationTarget::Pending(GenerationId::new(405)),
            &source,
            &reference,
            &unique,
            Duration::from_millis(3),
        )
        .await
        .unwrap_err();
    assert_eq!(env.blobs.len(), before);
}

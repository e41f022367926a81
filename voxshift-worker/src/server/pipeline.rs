//! Three-stage load → process → save pipeline
//!
//! Requests enter an unbounded `incoming` channel and carry a oneshot reply
//! sender through every stage. The loader takes a request, then waits for a
//! semaphore permit before loading it; the processor releases the permit when
//! it takes the request, so at most `max_loaded` requests are being loaded or
//! wait for the model at once. Inference itself is serialized by the
//! [`ModelRunner`] lock.

use super::error::DispatchError;
use crate::model::ModelRunner;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use voxshift_common::audio::AudioBuffer;
use voxshift_common::db::{AudioRecord, GenerationTarget, Ledger, NewGeneration};
use voxshift_common::{AudioId, GenerationId};

/// Successful generation as returned to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completed {
    pub output_id: AudioId,
    pub generation_id: GenerationId,
}

type Reply = oneshot::Sender<Result<Completed, DispatchError>>;

struct PipelineTask {
    source_id: AudioId,
    reference_id: AudioId,
    reply: Reply,
}

struct LoadedTask {
    reply: Reply,
    source: AudioRecord,
    reference: AudioRecord,
    source_audio: AudioBuffer,
    reference_audio: AudioBuffer,
    permit: OwnedSemaphorePermit,
}

struct ProcessedTask {
    reply: Reply,
    source: AudioRecord,
    reference: AudioRecord,
    output: AudioBuffer,
    elapsed: Duration,
}

/// Submission handle. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    incoming: mpsc::UnboundedSender<PipelineTask>,
    depth: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
    /// Loaded requests not yet taken by the processor. Counted by the stages
    /// themselves, independently of the semaphore.
    loaded: Arc<AtomicUsize>,
    peak_loaded: Arc<AtomicUsize>,
}

/// The stage tasks behind a [`Pipeline`]
pub struct PipelineWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn the loader, processor and saver tasks
    pub fn start(runner: ModelRunner, ledger: Ledger, max_loaded: usize) -> (Self, PipelineWorkers) {
        let max_loaded = max_loaded.max(1);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (loaded_tx, loaded_rx) = mpsc::unbounded_channel();
        let (processed_tx, processed_rx) = mpsc::unbounded_channel();

        let pipeline = Self {
            incoming: incoming_tx,
            depth: Arc::new(AtomicUsize::new(0)),
            permits: Arc::new(Semaphore::new(max_loaded)),
            loaded: Arc::new(AtomicUsize::new(0)),
            peak_loaded: Arc::new(AtomicUsize::new(0)),
        };

        let handles = vec![
            tokio::spawn(loader(
                pipeline.clone(),
                runner.clone(),
                ledger.clone(),
                incoming_rx,
                loaded_tx,
            )),
            tokio::spawn(processor(
                pipeline.clone(),
                runner.clone(),
                loaded_rx,
                processed_tx,
            )),
            tokio::spawn(saver(runner, ledger, processed_rx)),
        ];

        (pipeline, PipelineWorkers { handles })
    }

    /// Queue a request and wait for its result
    pub async fn submit(
        &self,
        source_id: AudioId,
        reference_id: AudioId,
    ) -> Result<Completed, DispatchError> {
        let (reply, response) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::SeqCst);
        let task = PipelineTask {
            source_id,
            reference_id,
            reply,
        };
        if self.incoming.send(task).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::Unavailable);
        }

        response.await.unwrap_or(Err(DispatchError::Unavailable))
    }

    /// Requests not yet admitted by the loader
    pub fn queue_size(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Requests loaded and not yet taken by the processor
    pub fn loaded_count(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Highest `loaded_count` observed so far
    pub fn peak_loaded(&self) -> usize {
        self.peak_loaded.load(Ordering::SeqCst)
    }
}

impl PipelineWorkers {
    /// Abort every stage and wait for them to finish. Callers still waiting
    /// get [`DispatchError::Unavailable`].
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Pipeline stage panicked");
                }
            }
        }
    }
}

async fn loader(
    pipeline: Pipeline,
    runner: ModelRunner,
    ledger: Ledger,
    mut incoming: mpsc::UnboundedReceiver<PipelineTask>,
    loaded: mpsc::UnboundedSender<LoadedTask>,
) {
    loop {
        let Some(task) = incoming.recv().await else {
            return;
        };
        // Still counted as queued while it waits for room in `loaded`
        let Ok(permit) = pipeline.permits.clone().acquire_owned().await else {
            return;
        };
        pipeline.depth.fetch_sub(1, Ordering::SeqCst);
        if task.reply.is_closed() {
            debug!(source_id = %task.source_id, "Caller went away; skipping request");
            continue;
        }

        let inputs = async {
            let (source, reference) = ledger
                .get_audio_pair(task.source_id, task.reference_id)
                .await?;
            let (source_audio, reference_audio) = runner.load_samples(&source, &reference).await?;
            Ok::<_, crate::error::WorkerError>((source, reference, source_audio, reference_audio))
        }
        .await;

        match inputs {
            Ok((source, reference, source_audio, reference_audio)) => {
                let next = LoadedTask {
                    reply: task.reply,
                    source,
                    reference,
                    source_audio,
                    reference_audio,
                    permit,
                };
                let now_loaded = pipeline.loaded.fetch_add(1, Ordering::SeqCst) + 1;
                pipeline.peak_loaded.fetch_max(now_loaded, Ordering::SeqCst);
                if loaded.send(next).is_err() {
                    pipeline.loaded.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
            Err(e) => {
                error!(
                    source_id = %task.source_id,
                    reference_id = %task.reference_id,
                    error = %e,
                    "Error loading request"
                );
                let _ = task.reply.send(Err(DispatchError::Load(e.to_string())));
            }
        }
    }
}

async fn processor(
    pipeline: Pipeline,
    runner: ModelRunner,
    mut loaded: mpsc::UnboundedReceiver<LoadedTask>,
    processed: mpsc::UnboundedSender<ProcessedTask>,
) {
    while let Some(task) = loaded.recv().await {
        pipeline.loaded.fetch_sub(1, Ordering::SeqCst);
        drop(task.permit);

        match runner.run_model(task.source_audio, task.reference_audio).await {
            Ok((output, elapsed)) => {
                let next = ProcessedTask {
                    reply: task.reply,
                    source: task.source,
                    reference: task.reference,
                    output,
                    elapsed,
                };
                if processed.send(next).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!(
                    source_id = %task.source.id,
                    reference_id = %task.reference.id,
                    error = %e,
                    "Error processing request"
                );
                let _ = task.reply.send(Err(DispatchError::Process(e.to_string())));
            }
        }
    }
}

async fn saver(
    runner: ModelRunner,
    ledger: Ledger,
    mut processed: mpsc::UnboundedReceiver<ProcessedTask>,
) {
    while let Some(task) = processed.recv().await {
        let target = GenerationTarget::New(NewGeneration {
            user_id: task.source.user_id,
            source_id: task.source.id,
            reference_id: task.reference.id,
        });

        let result = runner
            .process_output(
                &ledger,
                target,
                &task.source,
                &task.reference,
                &task.output,
                task.elapsed,
            )
            .await;

        let reply = match result {
            Ok((audio, generation)) => Ok(Completed {
                output_id: audio.id,
                generation_id: generation.id,
            }),
            Err(e) => {
                error!(
                    source_id = %task.source.id,
                    reference_id = %task.reference.id,
                    error = %e,
                    "Error saving request"
                );
                Err(DispatchError::Save(e.to_string()))
            }
        };
        let _ = task.reply.send(reply);
    }
}

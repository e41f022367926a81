//! Pluggable inference backends
//!
//! The conversion model is opaque to the worker: given a source and a
//! reference buffer in the model format, produce a new buffer at the same
//! sample rate. All data crosses the boundary as flat interleaved `&[f32]`.

use crate::error::{Result, WorkerError};
use std::path::Path;
use std::sync::Arc;
use voxshift_common::config::Device;

/// A loaded conversion model. `convert` blocks the calling thread for the
/// whole inference and is never called concurrently by the runner.
pub trait VoiceModel: Send + Sync {
    fn convert(
        &self,
        source: &[f32],
        reference: &[f32],
        sampling_steps: Option<u32>,
    ) -> Result<Vec<f32>>;
}

/// Builds a [`VoiceModel`] from resolved weights
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `load` needs a weights file from the model store
    fn requires_weights(&self) -> bool {
        true
    }

    fn load(&self, weights: Option<&Path>, device: Device) -> Result<Arc<dyn VoiceModel>>;
}

/// Returns the source audio untouched. Lets a deployment exercise the whole
/// queue → ledger path without real weights.
pub struct PassthroughLoader;

struct PassthroughModel;

impl ModelLoader for PassthroughLoader {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn requires_weights(&self) -> bool {
        false
    }

    fn load(&self, _weights: Option<&Path>, _device: Device) -> Result<Arc<dyn VoiceModel>> {
        Ok(Arc::new(PassthroughModel))
    }
}

impl VoiceModel for PassthroughModel {
    fn convert(&self, source: &[f32], _reference: &[f32], _steps: Option<u32>) -> Result<Vec<f32>> {
        if source.is_empty() {
            return Err(WorkerError::Inference("Source audio is empty".to_string()));
        }
        Ok(source.to_vec())
    }
}

/// Loader registered under `name` in configuration
pub fn loader_for(name: &str) -> Result<Box<dyn ModelLoader>> {
    match name {
        "passthrough" => Ok(Box::new(PassthroughLoader)),
        other => Err(WorkerError::ModelLoad(format!(
            "Unknown model backend: {}",
            other
        ))),
    }
}

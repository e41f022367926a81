//! Worker error types

use thiserror::Error;
use voxshift_common::GenerationId;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Broker unreachable or connection lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker rejected an operation on an open connection
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Generation {0} not found")]
    GenerationNotFound(GenerationId),

    #[error(transparent)]
    Common(#[from] voxshift_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Errors that must stop the process rather than a single message
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Connection(_) | WorkerError::ModelLoad(_))
    }
}

#[cfg(feature = "rabbit")]
impl From<lapin::Error> for WorkerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                WorkerError::Connection(err.to_string())
            }
            other => WorkerError::Queue(other.to_string()),
        }
    }
}

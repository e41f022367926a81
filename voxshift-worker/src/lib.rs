//! # voxshift-worker
//!
//! Asynchronous job dispatch for voice conversion:
//! - [`queue`]: one interface over the supported message brokers
//! - [`model`]: the singleton model runner with serialized inference
//! - [`worker`]: the queue-driven consumer loop
//! - [`server`]: the HTTP dispatch server with its three-stage pipeline

pub mod bench;
pub mod error;
pub mod health;
pub mod model;
pub mod queue;
pub mod server;
pub mod worker;

pub use error::{Result, WorkerError};
pub use model::ModelRunner;
pub use queue::MessageQueue;
pub use worker::Worker;

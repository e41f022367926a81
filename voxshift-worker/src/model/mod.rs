//! Model loading and serialized inference

pub mod backend;
pub mod runner;
pub mod store;

pub use backend::{loader_for, ModelLoader, PassthroughLoader, VoiceModel};
pub use runner::ModelRunner;
pub use store::ModelStore;

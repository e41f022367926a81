//! # Voxshift Common Library
//!
//! Shared code for the voxshift services including:
//! - Configuration loading
//! - Typed identities for ledger rows
//! - Audio buffers and the PCM codec used at the model boundary
//! - The content-addressed blob store
//! - The generation ledger (SQLite)

pub mod audio;
pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;

pub use error::{Error, Result};
pub use ids::{AudioId, GenerationId};

//! Queue message body
//!
//! Every backend carries the same body: the UTF-8 decimal generation id,
//! e.g. `b"42"`. Surrounding ASCII whitespace is tolerated on decode.

use crate::error::{Result, WorkerError};
use voxshift_common::GenerationId;

pub fn encode(id: GenerationId) -> Vec<u8> {
    id.to_string().into_bytes()
}

pub fn decode(body: &[u8]) -> Result<GenerationId> {
    let text = std::str::from_utf8(body)
        .map_err(|_| WorkerError::InvalidMessage(format!("Body is not UTF-8: {:?}", body)))?;
    text.parse::<GenerationId>()
        .map_err(|_| WorkerError::InvalidMessage(format!("Body is not a generation id: {:?}", text)))
}

//! Task wire format.
//!
//! An encoded envelope is one version byte followed by the bincode body. The
//! version byte lets an older node reject a frame it cannot read instead of
//! misinterpreting it.

use super::types::{Task, TaskEnvelope};
use thiserror::Error;

pub const WIRE_VERSION: u8 = 1;

pub const CONTENT_TYPE: &str = "application/x-farm-sync-task";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("unsupported wire version {0} (expected {WIRE_VERSION})")]
    UnsupportedVersion(u8),

    #[error("malformed task frame: {0}")]
    Malformed(#[from] bincode::Error),
}

pub fn encode_envelope(envelope: &TaskEnvelope) -> Result<Vec<u8>, CodecError> {
    let size = bincode::serialized_size(envelope)? as usize;
    let mut bytes = Vec::with_capacity(size + 1);
    bytes.push(WIRE_VERSION);
    bincode::serialize_into(&mut bytes, envelope)?;
    Ok(bytes)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<TaskEnvelope, CodecError> {
    let (version, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    if *version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(*version));
    }
    Ok(bincode::deserialize(body)?)
}

/// Encodes a bare task (used by the journal and in tests).
pub fn encode_task(task: &Task) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(task)?)
}

pub fn decode_task(bytes: &[u8]) -> Result<Task, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

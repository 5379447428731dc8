use serde::{de::DeserializeOwned, Serialize};

use crate::error::{BrokerError, Result};

/// An immutable unit of work.
///
/// Payloads are opaque bytes; this crate doesn't prescribe a serialization
/// format, but offers `serde_json` convenience wrappers
/// (`payload_serde_json`, `enqueue_serde_json`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub queue: String,
    pub priority: i64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn payload_serde_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(BrokerError::generic)
    }
}

pub(crate) fn encode_serde_json<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(BrokerError::generic)
}

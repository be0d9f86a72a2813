//! Wire envelope: `{ "context": {...}, "data": ... }` as UTF-8 JSON.
//!
//! Some producers encode `data` a second time as a JSON string. Decoding
//! accepts both forms; encoding emits either, selected by the publisher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Result;

/// Message plus the caller-supplied context it travels with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "empty_object")]
    pub context: Value,
    #[serde(default)]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Why an inbound body could not be turned into an envelope payload.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed data string: {0}")]
    Data(#[source] serde_json::Error),
}

impl Envelope {
    pub fn new(data: Value, context: Value) -> Self {
        Self { context, data }
    }

    /// Serialize to bytes. With `data_as_string` the payload is first encoded
    /// to a JSON string, matching producers that double-encode.
    pub fn encode(&self, data_as_string: bool) -> Result<Vec<u8>> {
        if data_as_string {
            let wire = Envelope {
                context: self.context.clone(),
                data: Value::String(serde_json::to_string(&self.data)?),
            };
            return Ok(serde_json::to_vec(&wire)?);
        }
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse bytes, unwrapping a string-encoded `data` member.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, EnvelopeError> {
        let mut envelope: Envelope =
            serde_json::from_slice(bytes).map_err(EnvelopeError::Envelope)?;
        if let Value::String(inner) = &envelope.data {
            envelope.data = serde_json::from_str(inner).map_err(EnvelopeError::Data)?;
        }
        Ok(envelope)
    }
}

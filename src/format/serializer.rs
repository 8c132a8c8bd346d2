//! Serializer implementations.

use crate::error::{Result, StoreError};
use crate::types::Payload;
use serde_json::Value;

/// Converts values to and from tagged payloads.
pub trait SnapshotSerializer: Send + Sync {
    /// Tag recorded alongside everything this serializer writes.
    fn format_tag(&self) -> &str;

    /// Serialize a value, returning its format tag and payload.
    fn dumps_typed(&self, value: &Value) -> Result<(String, Payload)>;

    /// Deserialize a payload previously written under `tag`.
    fn loads_typed(&self, tag: &str, payload: &Payload) -> Result<Value>;
}

fn check_tag(expected: &str, got: &str) -> Result<()> {
    if expected != got {
        return Err(StoreError::UnsupportedFormat(got.to_string()));
    }
    Ok(())
}

/// Plain JSON text.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const TAG: &'static str = "json";
}

impl SnapshotSerializer for JsonSerializer {
    fn format_tag(&self) -> &str {
        Self::TAG
    }

    fn dumps_typed(&self, value: &Value) -> Result<(String, Payload)> {
        let text = serde_json::to_string(value)?;
        Ok((Self::TAG.to_string(), Payload::Text(text)))
    }

    fn loads_typed(&self, tag: &str, payload: &Payload) -> Result<Value> {
        check_tag(Self::TAG, tag)?;
        let value = match payload {
            Payload::Text(text) => serde_json::from_str(text),
            Payload::Binary(bytes) => serde_json::from_slice(bytes),
        };
        value.map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// MessagePack bytes, for compact binary records.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessagePackSerializer;

impl MessagePackSerializer {
    pub const TAG: &'static str = "msgpack";
}

impl SnapshotSerializer for MessagePackSerializer {
    fn format_tag(&self) -> &str {
        Self::TAG
    }

    fn dumps_typed(&self, value: &Value) -> Result<(String, Payload)> {
        let bytes = rmp_serde::to_vec_named(value)?;
        Ok((Self::TAG.to_string(), Payload::Binary(bytes)))
    }

    fn loads_typed(&self, tag: &str, payload: &Payload) -> Result<Value> {
        check_tag(Self::TAG, tag)?;
        match payload {
            Payload::Binary(bytes) => Ok(rmp_serde::from_slice(bytes)?),
            Payload::Text(_) => Err(StoreError::Corruption(
                "msgpack record stored as text".into(),
            )),
        }
    }
}

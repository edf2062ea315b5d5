//! Key-value metadata payloads shared by every aggregate type that carries
//! metadata.

use serde::{Deserialize, Serialize};

use super::require;

/// Maximum accepted metadata key length.
pub const MAX_METADATA_KEY_LEN: usize = 200;

/// A key was set to a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSet {
    pub key: String,
    #[serde(with = "crate::crypto::base64_bytes")]
    pub value: Vec<u8>,
}

impl MetadataSet {
    pub(crate) fn validate(&self) -> Result<(), String> {
        require("key", &self.key)?;
        if self.value.is_empty() {
            return Err("metadata value must not be empty".to_string());
        }
        Ok(())
    }
}

/// A single key was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRemoved {
    pub key: String,
}

impl MetadataRemoved {
    pub(crate) fn validate(&self) -> Result<(), String> {
        require("key", &self.key)
    }
}

/// Aggregate-independent view of a metadata event.
///
/// Lets one reducer fold metadata for any aggregate type; see
/// [`EventPayload::metadata_change`](crate::EventPayload::metadata_change).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataChange<'a> {
    Set { key: &'a str, value: &'a [u8] },
    Removed { key: &'a str },
    RemovedAll,
}

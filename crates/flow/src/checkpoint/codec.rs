//! Checkpoint serialization: JSON, then zstd.

use super::Checkpoint;
use crate::error::{Error, Result};

/// Default zstd level.
pub const DEFAULT_LEVEL: i32 = 3;

/// Encodes checkpoints into the bytes a store persists.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointCodec {
    level: i32,
}

impl Default for CheckpointCodec {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl CheckpointCodec {
    /// Create a codec compressing at `level`.
    #[must_use]
    pub const fn new(level: i32) -> Self {
        Self { level }
    }

    /// Encode a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if serialization or compression fails.
    pub fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(checkpoint)?;
        zstd::encode_all(json.as_slice(), self.level)
            .map_err(|e| Error::codec(format!("zstd compression failed: {e}")))
    }

    /// Decode a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if decompression or deserialization fails.
    pub fn decode(&self, bytes: &[u8]) -> Result<Checkpoint> {
        let json = zstd::decode_all(bytes)
            .map_err(|e| Error::codec(format!("zstd decompression failed: {e}")))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

//! Versioned wire codec.
//!
//! Every message crossing the transport is wrapped in an [`Envelope`] and
//! encoded as JSON. Decoding checks the version before touching the body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current envelope version.
pub const WIRE_VERSION: u16 = 1;

/// Versioned wrapper around a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u16,
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wrap a body at the current version.
    pub const fn new(body: T) -> Self {
        Self {
            version: WIRE_VERSION,
            body,
        }
    }
}

#[derive(Deserialize)]
struct Header {
    version: u16,
}

/// Encode a message as an enveloped JSON string.
///
/// # Errors
///
/// Returns `Error::Codec` if the body cannot be serialized.
pub fn encode<T: Serialize>(body: &T) -> Result<String> {
    Ok(serde_json::to_string(&Envelope::new(body))?)
}

/// Decode an enveloped JSON string.
///
/// # Errors
///
/// Returns `Error::UnsupportedVersion` for a foreign version and
/// `Error::Codec` for malformed input.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let header: Header = serde_json::from_str(raw)?;
    if header.version != WIRE_VERSION {
        return Err(Error::UnsupportedVersion {
            found: header.version,
            expected: WIRE_VERSION,
        });
    }
    let envelope: Envelope<T> = serde_json::from_str(raw)?;
    Ok(envelope.body)
}

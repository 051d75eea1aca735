//! Self-describing binary encoding of persisted records.
//!
//! Records and pagination cursors are encoded as CBOR via `ciborium`.
//! CBOR round-trips the tagged [`MessageUnboxed`] union, integer-keyed
//! maps, and byte strings without an external schema, which is what lets
//! a corrupted record be *detected* rather than misread.
//!
//! Callers decide what a failure means: the sealing layer treats an
//! undecodable record as corruption, the query engine treats an
//! undecodable pagination cursor as a remote error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Failure to encode or decode a record.
#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(String);

/// Convenience result type using [`CodecError`].
pub type Result<T> = std::result::Result<T, CodecError>;

// ---------------------------------------------------------------------------
// Encode / Decode
// ---------------------------------------------------------------------------

/// Encodes `value` as CBOR.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR-encoded value.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data).map_err(|e: ciborium::de::Error<std::io::Error>| {
        CodecError(e.to_string())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

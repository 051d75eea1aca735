//! Symmetric sealing primitives for the banter chat client.
//!
//! Everything the local store needs to seal records at rest:
//! XChaCha20-Poly1305 AEAD, HKDF-SHA256 sub-key derivation, and
//! HMAC-SHA256 authentication. Key custody stays with the caller; this
//! crate never generates or stores long-lived keys.

pub mod aead;
pub mod hkdf;
pub mod mac;

use thiserror::Error;

// ---------------------------------------------------------------------------
// CryptoError
// ---------------------------------------------------------------------------

/// Failure of a cryptographic primitive.
#[derive(Debug, Error)]
#[error("crypto error: {reason}")]
pub struct CryptoError {
    /// Human-readable description of the failure.
    pub reason: String,
}

impl CryptoError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Convenience result type using [`CryptoError`].
pub type Result<T> = std::result::Result<T, CryptoError>;

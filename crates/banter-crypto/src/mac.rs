//! HMAC-SHA256 record authentication tags.
//!
//! One keyed primitive serves two jobs in the storage layer: the
//! Encrypt-then-MAC tag over sealed records, verified before any
//! decryption happens, and deterministic per-record nonce derivation.
//! Both run through the same keyed state; only the final step differs.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Byte length of a tag.
pub const TAG_LEN: usize = 32;

/// The keyed state shared by [`tag`] and [`verify_tag`].
fn keyed(key: &[u8], data: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::new(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac)
}

/// Computes the tag of `data` under `key`.
pub fn tag(key: &[u8], data: &[u8]) -> Result<[u8; TAG_LEN]> {
    let digest = keyed(key, data)?.finalize().into_bytes();
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Checks `expected` against the tag of `data` under `key`, in
/// constant time.
///
/// # Errors
///
/// Returns [`CryptoError`] on a mismatch — the data was altered or the
/// key is not the one that produced the tag.
pub fn verify_tag(key: &[u8], data: &[u8], expected: &[u8; TAG_LEN]) -> Result<()> {
    keyed(key, data)?
        .verify_slice(expected)
        .map_err(|_| CryptoError::new("tag mismatch: data was altered or keyed differently"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

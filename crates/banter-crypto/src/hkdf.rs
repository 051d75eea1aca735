//! HKDF-SHA256 sub-key derivation.
//!
//! The store never needs variable-length key material: everything it
//! derives is a 32-byte sub-key of the per-device secret, domain-
//! separated by an info string (RFC 5869 Extract-and-Expand with
//! SHA-256). The API is fixed-size on both ends so a wrong-length key
//! cannot exist at runtime.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::{CryptoError, Result};

/// Derives a 32-byte sub-key from `secret`.
///
/// `salt` namespaces the deployment; an empty slice is valid per RFC
/// 5869 §3.1 and stands in for a zero-filled salt of hash length.
/// `info` separates this sub-key's domain from every other key derived
/// from the same secret — two calls agree exactly when all three
/// inputs agree.
pub fn derive_subkey(secret: &[u8; 32], salt: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let salt_opt: Option<&[u8]> = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt_opt, secret);

    let mut subkey = [0u8; 32];
    hk.expand(info, &mut subkey)
        .map_err(|e| CryptoError::new(format!("HKDF-SHA256 expand failed: {e}")))?;
    Ok(subkey)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! XChaCha20-Poly1305 authenticated encryption.
//!
//! All symmetric encryption in banter uses XChaCha20-Poly1305 AEAD with
//! 192-bit (24-byte) nonces. Nonces **must never be reused** with the
//! same key; the storage layer derives them deterministically from record
//! coordinates so that a given record always reseals identically.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::{CryptoError, Result};

// ---------------------------------------------------------------------------
// AeadNonce
// ---------------------------------------------------------------------------

/// 192-bit (24-byte) nonce for XChaCha20-Poly1305.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AeadNonce([u8; 24]);

impl AeadNonce {
    /// Fixed byte length of an XChaCha20-Poly1305 nonce.
    pub const LEN: usize = 24;

    /// Creates an [`AeadNonce`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 24]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying 24-byte array.
    pub fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Encrypt / Decrypt
// ---------------------------------------------------------------------------

/// Encrypts `plaintext` with XChaCha20-Poly1305.
///
/// # Parameters
///
/// - `key` — 256-bit symmetric key.
/// - `nonce` — 192-bit nonce, unique per (key, record).
/// - `plaintext` — data to encrypt.
/// - `aad` — additional authenticated data. Authenticated but **not**
///   encrypted. Pass `&[]` if unused.
///
/// # Returns
///
/// The ciphertext with the 16-byte Poly1305 tag appended.
pub fn encrypt_xchacha20(
    key: &[u8; 32],
    nonce: &AeadNonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(&nonce.0);
    let payload = Payload { msg: plaintext, aad };

    cipher
        .encrypt(xnonce, payload)
        .map_err(|e| CryptoError::new(format!("XChaCha20-Poly1305 encryption failed: {e}")))
}

/// Decrypts `ciphertext` with XChaCha20-Poly1305.
///
/// # Errors
///
/// Returns [`CryptoError`] if tag verification fails (wrong key, wrong
/// nonce, tampered ciphertext, or wrong AAD).
pub fn decrypt_xchacha20(
    key: &[u8; 32],
    nonce: &AeadNonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(&nonce.0);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher
        .decrypt(xnonce, payload)
        .map_err(|e| CryptoError::new(format!("XChaCha20-Poly1305 decryption failed: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

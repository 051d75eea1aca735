//! Sealed serialization of persisted records.
//!
//! Every value the store persists follows the Encrypt-then-MAC pattern:
//!
//! ```text
//! [nonce 24B] [ciphertext variable] [hmac 32B]
//! ```
//!
//! The HMAC is verified **before** any decryption attempt. Sub-keys for
//! encryption, authentication, and nonce derivation come from the
//! per-device secret-box key via HKDF-SHA256 with domain-separating
//! info strings.
//!
//! Nonces are not random: each is an HMAC of the record's coordinates
//! (conversation, user, record kind, record key). Rewriting a record
//! with identical plaintext therefore produces an identical sealed
//! value, which is what makes repeated merges byte-idempotent on disk.

use banter_crypto::aead::{decrypt_xchacha20, encrypt_xchacha20, AeadNonce};
use banter_crypto::{hkdf, mac};
use banter_types::{ConversationId, UserId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec;
use crate::errors::{Result, StorageError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// HKDF salt for deriving sub-keys from the secret-box key.
const HKDF_SALT: &[u8] = b"banter-chat-storage";

/// HKDF info for the encryption sub-key.
const HKDF_INFO_ENC: &[u8] = b"record encryption";

/// HKDF info for the HMAC sub-key.
const HKDF_INFO_MAC: &[u8] = b"record authentication";

/// HKDF info for the nonce-derivation sub-key.
const HKDF_INFO_NONCE: &[u8] = b"record nonce";

/// Minimum sealed value size: nonce + AEAD tag (16) + HMAC.
const MIN_SEALED_LEN: usize = AeadNonce::LEN + 16 + mac::TAG_LEN;

// ---------------------------------------------------------------------------
// RecordKind
// ---------------------------------------------------------------------------

/// What kind of record a sealed value holds. Bound into the nonce so
/// records of different kinds can never be swapped for one another.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordKind {
    /// Per-conversation block index.
    BlockIndex,
    /// Message block.
    Block,
    /// Max-message-id tracker entry.
    MaxMsgId,
    /// Delete-history tracker entry.
    DelhTracker,
}

impl RecordKind {
    fn label(self) -> &'static [u8] {
        match self {
            Self::BlockIndex => b"blockindex",
            Self::Block => b"block",
            Self::MaxMsgId => b"maxmsgid",
            Self::DelhTracker => b"delhtracker",
        }
    }
}

// ---------------------------------------------------------------------------
// Sealer
// ---------------------------------------------------------------------------

/// Sub-keys derived from the secret-box key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKeys {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    nonce_key: [u8; 32],
}

/// Seals and opens records for one (conversation, user) scope.
///
/// Derived once per operation from the fetched secret-box key; never
/// cached across operations.
pub struct Sealer {
    keys: DerivedKeys,
    conv_id: ConversationId,
    uid: UserId,
}

impl Sealer {
    /// Derives the sealing sub-keys for `(conv_id, uid)` from the
    /// 32-byte secret-box key.
    pub fn derive(secret: &[u8; 32], conv_id: &ConversationId, uid: &UserId) -> Result<Self> {
        let derive_one = |info: &[u8]| -> Result<[u8; 32]> {
            hkdf::derive_subkey(secret, HKDF_SALT, info).map_err(|e| StorageError::Crypto {
                msg: format!("sub-key derivation failed: {e}"),
            })
        };

        Ok(Self {
            keys: DerivedKeys {
                enc_key: derive_one(HKDF_INFO_ENC)?,
                mac_key: derive_one(HKDF_INFO_MAC)?,
                nonce_key: derive_one(HKDF_INFO_NONCE)?,
            },
            conv_id: conv_id.clone(),
            uid: uid.clone(),
        })
    }

    /// The conversation this sealer is scoped to.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conv_id
    }

    /// The user this sealer is scoped to.
    pub fn user_id(&self) -> &UserId {
        &self.uid
    }

    /// Derives the record nonce from (conv, uid, kind, record key).
    ///
    /// Each component is length-prefixed so distinct coordinate tuples
    /// can never collide on concatenation.
    fn derive_nonce(&self, kind: RecordKind, record_key: &[u8]) -> Result<AeadNonce> {
        let parts: [&[u8]; 4] = [
            self.conv_id.as_bytes(),
            self.uid.as_bytes(),
            kind.label(),
            record_key,
        ];
        let mut input = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
        for part in parts {
            input.extend_from_slice(&(part.len() as u32).to_be_bytes());
            input.extend_from_slice(part);
        }

        let tag = mac::tag(&self.keys.nonce_key, &input).map_err(|e| StorageError::Crypto {
            msg: format!("nonce derivation failed: {e}"),
        })?;
        let mut nonce = [0u8; AeadNonce::LEN];
        nonce.copy_from_slice(&tag[..AeadNonce::LEN]);
        Ok(AeadNonce::from_bytes(nonce))
    }

    /// Encodes and seals a record: serialize → encrypt → MAC → pack.
    pub fn seal<T: Serialize>(
        &self,
        kind: RecordKind,
        record_key: &[u8],
        value: &T,
    ) -> Result<Vec<u8>> {
        let plaintext = codec::encode(value).map_err(|e| StorageError::Internal {
            msg: format!("record encoding failed: {e}"),
        })?;

        let nonce = self.derive_nonce(kind, record_key)?;
        let ciphertext = encrypt_xchacha20(&self.keys.enc_key, &nonce, &plaintext, &[]).map_err(
            |e| StorageError::Crypto {
                msg: format!("record encryption failed: {e}"),
            },
        )?;

        let mut mac_input = Vec::with_capacity(AeadNonce::LEN + ciphertext.len());
        mac_input.extend_from_slice(nonce.as_bytes());
        mac_input.extend_from_slice(&ciphertext);
        let tag = mac::tag(&self.keys.mac_key, &mac_input).map_err(|e| StorageError::Crypto {
            msg: format!("record authentication failed: {e}"),
        })?;

        let mut sealed = Vec::with_capacity(AeadNonce::LEN + ciphertext.len() + mac::TAG_LEN);
        sealed.extend_from_slice(nonce.as_bytes());
        sealed.extend_from_slice(&ciphertext);
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    /// Opens a sealed record: unpack → verify MAC → decrypt → decode.
    pub fn open<T: DeserializeOwned>(
        &self,
        kind: RecordKind,
        record_key: &[u8],
        raw: &[u8],
    ) -> Result<T> {
        if raw.len() < MIN_SEALED_LEN {
            return Err(StorageError::Corrupt {
                msg: format!(
                    "sealed record too short: expected at least {MIN_SEALED_LEN} bytes, got {}",
                    raw.len()
                ),
            });
        }

        let mut nonce_bytes = [0u8; AeadNonce::LEN];
        nonce_bytes.copy_from_slice(&raw[..AeadNonce::LEN]);
        let stored_nonce = AeadNonce::from_bytes(nonce_bytes);

        // The nonce is redundant with the record coordinates; a mismatch
        // means the value was moved or spliced.
        let expected_nonce = self.derive_nonce(kind, record_key)?;
        if stored_nonce != expected_nonce {
            return Err(StorageError::Corrupt {
                msg: "sealed record nonce does not match its coordinates".into(),
            });
        }

        let tag_start = raw.len() - mac::TAG_LEN;
        let mut expected_tag = [0u8; mac::TAG_LEN];
        expected_tag.copy_from_slice(&raw[tag_start..]);
        let ciphertext = &raw[AeadNonce::LEN..tag_start];

        let mut mac_input = Vec::with_capacity(AeadNonce::LEN + ciphertext.len());
        mac_input.extend_from_slice(&nonce_bytes);
        mac_input.extend_from_slice(ciphertext);
        mac::verify_tag(&self.keys.mac_key, &mac_input, &expected_tag).map_err(|_| {
            StorageError::Corrupt {
                msg: "sealed record failed authentication".into(),
            }
        })?;

        let plaintext = decrypt_xchacha20(&self.keys.enc_key, &stored_nonce, ciphertext, &[])
            .map_err(|e| StorageError::Crypto {
                msg: format!("sealed record failed to open: {e}"),
            })?;

        codec::decode(&plaintext).map_err(|e| StorageError::Corrupt {
            msg: format!("sealed record failed to decode: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> Sealer {
        Sealer::derive(
            &[0x42u8; 32],
            &ConversationId::new(&b"conv-1"[..]),
            &UserId::new(&b"user-1"[..]),
        )
        .expect("derive")
    }

    #[test]
    fn seal_open_roundtrip() -> Result<()> {
        let s = sealer();
        let sealed = s.seal(RecordKind::Block, b"bl:0", &vec![1u64, 2, 3])?;
        let back: Vec<u64> = s.open(RecordKind::Block, b"bl:0", &sealed)?;
        assert_eq!(back, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn identical_rewrites_seal_identically() -> Result<()> {
        let s = sealer();
        let a = s.seal(RecordKind::Block, b"bl:7", &"same record")?;
        let b = s.seal(RecordKind::Block, b"bl:7", &"same record")?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn different_record_keys_seal_differently() -> Result<()> {
        let s = sealer();
        let a = s.seal(RecordKind::Block, b"bl:1", &"same record")?;
        let b = s.seal(RecordKind::Block, b"bl:2", &"same record")?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn kind_is_bound_into_the_seal() -> Result<()> {
        let s = sealer();
        let sealed = s.seal(RecordKind::Block, b"k", &"record")?;
        let reopened: Result<String> = s.open(RecordKind::MaxMsgId, b"k", &sealed);
        assert!(matches!(reopened, Err(StorageError::Corrupt { .. })));
        Ok(())
    }

    #[test]
    fn tampered_value_is_corrupt() -> Result<()> {
        let s = sealer();
        let mut sealed = s.seal(RecordKind::Block, b"k", &"record")?;
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0xFF;
        let reopened: Result<String> = s.open(RecordKind::Block, b"k", &sealed);
        assert!(matches!(reopened, Err(StorageError::Corrupt { .. })));
        Ok(())
    }

    #[test]
    fn truncated_value_is_corrupt() {
        let s = sealer();
        let reopened: Result<String> = s.open(RecordKind::Block, b"k", b"short");
        assert!(matches!(reopened, Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn different_scope_cannot_open() -> Result<()> {
        let s = sealer();
        let other = Sealer::derive(
            &[0x42u8; 32],
            &ConversationId::new(&b"conv-2"[..]),
            &UserId::new(&b"user-1"[..]),
        )
        .expect("derive");

        let sealed = s.seal(RecordKind::Block, b"k", &"record")?;
        let reopened: Result<String> = other.open(RecordKind::Block, b"k", &sealed);
        assert!(reopened.is_err());
        Ok(())
    }
}

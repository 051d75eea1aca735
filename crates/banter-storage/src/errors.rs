//! The storage error taxonomy.
//!
//! Every error kind answers [`should_clear`](StorageError::should_clear):
//! whether its appearance means the on-disk cache can no longer be
//! trusted and must be wiped. Misses and caller mistakes never clear;
//! decode, authentication, and invariant failures always do.

use banter_types::MessageId;
use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Central error type for the conversation store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A message expected to be present locally is not. Collectors
    /// interpret this; it is routine, not a fault.
    #[error("message {msg_id} not found in local conversation storage")]
    Miss {
        /// The id that was missing.
        msg_id: MessageId,
    },

    /// Malformed input from the caller or the server, e.g. an
    /// undecodable pagination cursor.
    #[error("remote error: {msg}")]
    Remote {
        /// Human-readable description of the bad input.
        msg: String,
    },

    /// Environmental failure outside the store's control, e.g. the
    /// secret-key provider or backend I/O.
    #[error("storage error: {msg}")]
    Misc {
        /// Human-readable description of the failure.
        msg: String,
    },

    /// An invariant the store maintains was found violated.
    #[error("internal storage error: {msg}")]
    Internal {
        /// Human-readable description of the violated invariant.
        msg: String,
    },

    /// An on-disk record failed to decode or authenticate.
    #[error("corrupt storage record: {msg}")]
    Corrupt {
        /// Human-readable description of the corruption.
        msg: String,
    },

    /// Key derivation or seal opening failed.
    #[error("storage crypto failure: {msg}")]
    Crypto {
        /// Human-readable description of the crypto failure.
        msg: String,
    },

    /// The operation's context was canceled.
    #[error("storage operation canceled")]
    Canceled,
}

impl StorageError {
    /// Whether this error means the local cache is untrustworthy and the
    /// affected conversation (or the whole store) must be cleared.
    pub fn should_clear(&self) -> bool {
        matches!(
            self,
            Self::Internal { .. } | Self::Corrupt { .. } | Self::Crypto { .. }
        )
    }

    /// Whether this is the expected-absence kind.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss { .. })
    }
}

/// Convenience result type using [`StorageError`].
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

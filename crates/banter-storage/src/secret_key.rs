//! The per-device secret-box key dependency.
//!
//! Key custody lives outside this crate: the provider may consult a
//! device keystore or prompt the user, and may block while doing so.
//! The store fetches the key once per public operation and never caches
//! it across lock releases.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::context::Context;

/// Errors from a key provider are opaque to the store; they surface as
/// environmental failures.
pub type KeyProviderError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// SecretKeyProvider
// ---------------------------------------------------------------------------

/// Supplies the 32-byte symmetric key used to seal records at rest.
pub trait SecretKeyProvider: Send + Sync {
    /// Returns the current secret-box key.
    ///
    /// Called under the global storage lock, once per operation. May
    /// block on user interaction; implementations should honor `ctx`.
    fn secret_box_key(&self, ctx: &Context) -> Result<[u8; 32], KeyProviderError>;
}

// ---------------------------------------------------------------------------
// StaticKeyProvider
// ---------------------------------------------------------------------------

/// A provider that hands out one fixed key. Suitable for tests and for
/// embedders that manage key material themselves.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StaticKeyProvider {
    key: [u8; 32],
}

impl StaticKeyProvider {
    /// Creates a provider for `key`.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl SecretKeyProvider for StaticKeyProvider {
    fn secret_box_key(&self, _ctx: &Context) -> Result<[u8; 32], KeyProviderError> {
        Ok(self.key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

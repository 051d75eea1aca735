//! Operation context with cooperative cancellation.
//!
//! A [`Context`] is threaded through every public operation and checked
//! before each backend touchpoint. Cancellation is cooperative: a
//! canceled context makes the operation return
//! [`StorageError::Canceled`](crate::StorageError::Canceled) at its next
//! check, after the global storage lock has been released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{Result, StorageError};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Shared cancellation handle for one logical operation.
///
/// Clones share the same flag; cancel any clone and every holder sees it.
#[derive(Clone, Debug, Default)]
pub struct Context {
    canceled: Arc<AtomicBool>,
}

impl Context {
    /// A context that is never canceled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Flags the context as canceled.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Whether the context has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Errors with [`StorageError::Canceled`] once the context is canceled.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(StorageError::Canceled);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Key-value backend abstraction and the sled implementation.
//!
//! The store reads and writes opaque byte values through [`KvBackend`],
//! keyed by a namespace plus a string. [`SledBackend`] maps each
//! namespace to its own sled tree. `nuke` is the emergency exit: it
//! clears every namespace at once.

use std::path::Path;

use crate::context::Context;
use crate::errors::{Result, StorageError};

// ---------------------------------------------------------------------------
// Namespace / DbKey
// ---------------------------------------------------------------------------

/// Partition of the backend key space.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    /// Per-conversation block index records.
    ChatBlockIndex,
    /// Message block records.
    ChatBlocks,
    /// Max-message-id tracker records.
    ChatIdTracker,
    /// Delete-history tracker records.
    ChatDelhTracker,
}

/// All namespaces the store writes to.
pub const ALL_NAMESPACES: [Namespace; 4] = [
    Namespace::ChatBlockIndex,
    Namespace::ChatBlocks,
    Namespace::ChatIdTracker,
    Namespace::ChatDelhTracker,
];

impl Namespace {
    /// The sled tree backing this namespace.
    pub fn tree_name(self) -> &'static str {
        match self {
            Self::ChatBlockIndex => "chat_block_index",
            Self::ChatBlocks => "chat_blocks",
            Self::ChatIdTracker => "chat_id_tracker",
            Self::ChatDelhTracker => "chat_delh_tracker",
        }
    }
}

/// A fully qualified backend key.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DbKey {
    /// The namespace this key lives in.
    pub namespace: Namespace,
    /// The key string within the namespace.
    pub key: String,
}

impl DbKey {
    /// Creates a `DbKey`.
    pub fn new(namespace: Namespace, key: impl Into<String>) -> Self {
        Self {
            namespace,
            key: key.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// KvBackend
// ---------------------------------------------------------------------------

/// Opaque byte store underneath the conversation cache.
///
/// Implementations must tolerate concurrent handles but may assume the
/// store's global lock serializes the actual calls.
pub trait KvBackend: Send + Sync {
    /// Reads a value. `Ok(None)` when the key does not exist.
    fn get(&self, ctx: &Context, key: &DbKey) -> Result<Option<Vec<u8>>>;

    /// Writes a value, overwriting any prior one.
    fn put(&self, ctx: &Context, key: &DbKey, value: &[u8]) -> Result<()>;

    /// Removes a key. Removing an absent key is not an error.
    fn delete(&self, ctx: &Context, key: &DbKey) -> Result<()>;

    /// Clears every namespace. Last resort after corruption.
    fn nuke(&self, ctx: &Context) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SledBackend
// ---------------------------------------------------------------------------

/// Sled-backed [`KvBackend`], one tree per namespace.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Opens (or creates) the backend at `path`.
    ///
    /// Pre-creates all namespace trees so later access cannot fail on
    /// tree creation.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| StorageError::Misc {
            msg: format!("failed to open sled database: {e}"),
        })?;

        for ns in ALL_NAMESPACES {
            db.open_tree(ns.tree_name())
                .map_err(|e| StorageError::Misc {
                    msg: format!("failed to open tree '{}': {e}", ns.tree_name()),
                })?;
        }

        Ok(Self { db })
    }

    fn tree(&self, ns: Namespace) -> Result<sled::Tree> {
        self.db
            .open_tree(ns.tree_name())
            .map_err(|e| StorageError::Misc {
                msg: format!("failed to open tree '{}': {e}", ns.tree_name()),
            })
    }
}

impl KvBackend for SledBackend {
    fn get(&self, ctx: &Context, key: &DbKey) -> Result<Option<Vec<u8>>> {
        ctx.check()?;
        let raw = self
            .tree(key.namespace)?
            .get(key.key.as_bytes())
            .map_err(|e| StorageError::Misc {
                msg: format!("sled get failed: {e}"),
            })?;
        Ok(raw.map(|v| v.to_vec()))
    }

    fn put(&self, ctx: &Context, key: &DbKey, value: &[u8]) -> Result<()> {
        ctx.check()?;
        self.tree(key.namespace)?
            .insert(key.key.as_bytes(), value)
            .map_err(|e| StorageError::Misc {
                msg: format!("sled insert failed: {e}"),
            })?;
        Ok(())
    }

    fn delete(&self, ctx: &Context, key: &DbKey) -> Result<()> {
        ctx.check()?;
        self.tree(key.namespace)?
            .remove(key.key.as_bytes())
            .map_err(|e| StorageError::Misc {
                msg: format!("sled remove failed: {e}"),
            })?;
        Ok(())
    }

    fn nuke(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        for ns in ALL_NAMESPACES {
            self.tree(ns)?.clear().map_err(|e| StorageError::Misc {
                msg: format!("sled clear failed for '{}': {e}", ns.tree_name()),
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_dir() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "banter-backend-test-{}-{}-{}",
            std::process::id(),
            id,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0),
        ));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn put_get_delete_roundtrip() -> Result<()> {
        let backend = SledBackend::open(&temp_dir())?;
        let ctx = Context::background();
        let key = DbKey::new(Namespace::ChatBlocks, "bl:aa:bb:0");

        assert_eq!(backend.get(&ctx, &key)?, None);
        backend.put(&ctx, &key, b"value")?;
        assert_eq!(backend.get(&ctx, &key)?, Some(b"value".to_vec()));

        backend.delete(&ctx, &key)?;
        assert_eq!(backend.get(&ctx, &key)?, None);
        // deleting again is fine
        backend.delete(&ctx, &key)?;
        Ok(())
    }

    #[test]
    fn namespaces_do_not_collide() -> Result<()> {
        let backend = SledBackend::open(&temp_dir())?;
        let ctx = Context::background();
        let a = DbKey::new(Namespace::ChatIdTracker, "same");
        let b = DbKey::new(Namespace::ChatDelhTracker, "same");

        backend.put(&ctx, &a, b"ids")?;
        backend.put(&ctx, &b, b"delh")?;
        assert_eq!(backend.get(&ctx, &a)?, Some(b"ids".to_vec()));
        assert_eq!(backend.get(&ctx, &b)?, Some(b"delh".to_vec()));
        Ok(())
    }

    #[test]
    fn nuke_clears_every_namespace() -> Result<()> {
        let backend = SledBackend::open(&temp_dir())?;
        let ctx = Context::background();
        for ns in ALL_NAMESPACES {
            backend.put(&ctx, &DbKey::new(ns, "k"), b"v")?;
        }

        backend.nuke(&ctx)?;
        for ns in ALL_NAMESPACES {
            assert_eq!(backend.get(&ctx, &DbKey::new(ns, "k"))?, None);
        }
        Ok(())
    }

    #[test]
    fn canceled_context_rejects_calls() -> Result<()> {
        let backend = SledBackend::open(&temp_dir())?;
        let ctx = Context::background();
        ctx.cancel();
        let key = DbKey::new(Namespace::ChatBlocks, "k");
        assert!(matches!(
            backend.get(&ctx, &key),
            Err(StorageError::Canceled)
        ));
        Ok(())
    }
}

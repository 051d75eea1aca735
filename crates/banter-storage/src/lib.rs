//! Encrypted per-conversation message store for the banter chat client.
//!
//! Caches unboxed messages on disk, keyed by (conversation, user), so
//! the UI can page through threads without a server round trip. The
//! interesting part is invariant maintenance across overlapping merges:
//! a batch may edit a stored message, blank a deleted one, rewrite an
//! arbitrary prefix via a delete-history directive, or reference ids
//! the client has never seen. Corruption is detected, not tolerated: a
//! record that fails to authenticate or decode wipes the conversation's
//! index rather than drifting silently.
//!
//! Everything at rest is sealed with the per-device secret-box key; see
//! [`seal`] for the record format and [`block_engine`] for the on-disk
//! layout.

pub mod backend;
pub mod block_engine;
pub mod codec;
pub mod collectors;
pub mod context;
mod delh_tracker;
pub mod errors;
mod id_tracker;
pub mod pager;
pub mod seal;
pub mod secret_key;
pub mod storage;

pub use backend::{DbKey, KvBackend, Namespace, SledBackend};
pub use block_engine::{BlockEngine, EngineContext, StorageEngine, BLOCK_SIZE};
pub use collectors::{
    HoleyResultCollector, InsatiableResultCollector, ResultCollector, SimpleResultCollector,
    TypedResultCollector,
};
pub use context::Context;
pub use errors::{Result, StorageError};
pub use secret_key::{SecretKeyProvider, StaticKeyProvider};
pub use storage::{MergeResult, Storage};

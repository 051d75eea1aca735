//! Per-conversation delete-history horizons.
//!
//! One sealed record per (conversation, user) with three watermarks:
//!
//! - `min_deletable_message` — smallest locally stored deletable id that
//!   still has a body; what an incoming directive could still affect.
//! - `max_delete_history_upto` — largest `upto` ever observed, applied
//!   or record-only.
//! - `deleted_upto` — largest `upto` actually applied locally.
//!
//! `deleted_upto ≤ max_delete_history_upto` holds by construction:
//! recording an application also raises the observed horizon.

use std::sync::Arc;

use banter_types::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};

use crate::backend::{DbKey, KvBackend, Namespace};
use crate::context::Context;
use crate::errors::{Result, StorageError};
use crate::seal::{RecordKind, Sealer};

// ---------------------------------------------------------------------------
// DelhTrackerEntry
// ---------------------------------------------------------------------------

/// The stored watermark triple. A zero id means "unset".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DelhTrackerEntry {
    /// Smallest stored deletable id with a body.
    pub min_deletable_message: MessageId,
    /// Largest delete-history horizon observed.
    pub max_delete_history_upto: MessageId,
    /// Largest horizon actually applied to local messages.
    pub deleted_upto: MessageId,
}

// ---------------------------------------------------------------------------
// DelhTracker
// ---------------------------------------------------------------------------

pub(crate) struct DelhTracker {
    backend: Arc<dyn KvBackend>,
}

fn db_key(conv_id: &ConversationId, uid: &UserId) -> DbKey {
    DbKey::new(Namespace::ChatDelhTracker, format!("dht:{uid}:{conv_id}"))
}

impl DelhTracker {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// The stored entry, or a miss if this conversation has none yet.
    pub fn get_entry(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> Result<DelhTrackerEntry> {
        let key = db_key(conv_id, uid);
        match self.backend.get(ctx, &key)? {
            None => Err(StorageError::Miss {
                msg_id: MessageId::NONE,
            }),
            Some(raw) => sealer.open(RecordKind::DelhTracker, key.key.as_bytes(), &raw),
        }
    }

    fn entry_or_default(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> Result<DelhTrackerEntry> {
        match self.get_entry(ctx, sealer, conv_id, uid) {
            Ok(entry) => Ok(entry),
            Err(err) if err.is_miss() => Ok(DelhTrackerEntry::default()),
            Err(err) => Err(err),
        }
    }

    fn put_entry(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        entry: &DelhTrackerEntry,
    ) -> Result<()> {
        let key = db_key(conv_id, uid);
        let sealed = sealer.seal(RecordKind::DelhTracker, key.key.as_bytes(), entry)?;
        self.backend.put(ctx, &key, &sealed)
    }

    /// Sets the minimum deletable message watermark.
    pub fn set_min_deletable_message(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        msg_id: MessageId,
    ) -> Result<()> {
        let mut entry = self.entry_or_default(ctx, sealer, conv_id, uid)?;
        entry.min_deletable_message = msg_id;
        self.put_entry(ctx, sealer, conv_id, uid, &entry)
    }

    /// Sets the observed delete-history horizon.
    pub fn set_max_delete_history_upto(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        msg_id: MessageId,
    ) -> Result<()> {
        let mut entry = self.entry_or_default(ctx, sealer, conv_id, uid)?;
        entry.max_delete_history_upto = msg_id;
        self.put_entry(ctx, sealer, conv_id, uid, &entry)
    }

    /// Records that a delete-history up to `msg_id` was applied locally.
    /// Also raises the observed horizon so the applied watermark can
    /// never pass it.
    pub fn set_deleted_upto(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        msg_id: MessageId,
    ) -> Result<()> {
        let mut entry = self.entry_or_default(ctx, sealer, conv_id, uid)?;
        entry.deleted_upto = msg_id;
        if entry.max_delete_history_upto < msg_id {
            entry.max_delete_history_upto = msg_id;
        }
        self.put_entry(ctx, sealer, conv_id, uid, &entry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::backend::SledBackend;

    use super::*;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_dir() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "banter-delh-test-{}-{}-{}",
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

    fn setup() -> (DelhTracker, Sealer, Context, ConversationId, UserId) {
        let backend = Arc::new(SledBackend::open(&temp_dir()).expect("backend"));
        let conv = ConversationId::new(&b"c"[..]);
        let uid = UserId::new(&b"u"[..]);
        let sealer = Sealer::derive(&[0x11u8; 32], &conv, &uid).expect("sealer");
        (
            DelhTracker::new(backend),
            sealer,
            Context::background(),
            conv,
            uid,
        )
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let (tracker, sealer, ctx, conv, uid) = setup();
        let res = tracker.get_entry(&ctx, &sealer, &conv, &uid);
        assert!(matches!(res, Err(StorageError::Miss { .. })));
    }

    #[test]
    fn setters_preserve_the_other_fields() -> Result<()> {
        let (tracker, sealer, ctx, conv, uid) = setup();

        tracker.set_min_deletable_message(&ctx, &sealer, &conv, &uid, MessageId::new(5))?;
        tracker.set_max_delete_history_upto(&ctx, &sealer, &conv, &uid, MessageId::new(40))?;

        let entry = tracker.get_entry(&ctx, &sealer, &conv, &uid)?;
        assert_eq!(entry.min_deletable_message, MessageId::new(5));
        assert_eq!(entry.max_delete_history_upto, MessageId::new(40));
        assert_eq!(entry.deleted_upto, MessageId::NONE);
        Ok(())
    }

    #[test]
    fn deleted_upto_drags_the_observed_horizon() -> Result<()> {
        let (tracker, sealer, ctx, conv, uid) = setup();

        tracker.set_deleted_upto(&ctx, &sealer, &conv, &uid, MessageId::new(30))?;
        let entry = tracker.get_entry(&ctx, &sealer, &conv, &uid)?;
        assert_eq!(entry.deleted_upto, MessageId::new(30));
        assert_eq!(entry.max_delete_history_upto, MessageId::new(30));

        // A larger observed horizon is left alone.
        tracker.set_max_delete_history_upto(&ctx, &sealer, &conv, &uid, MessageId::new(100))?;
        tracker.set_deleted_upto(&ctx, &sealer, &conv, &uid, MessageId::new(50))?;
        let entry = tracker.get_entry(&ctx, &sealer, &conv, &uid)?;
        assert_eq!(entry.deleted_upto, MessageId::new(50));
        assert_eq!(entry.max_delete_history_upto, MessageId::new(100));
        Ok(())
    }
}

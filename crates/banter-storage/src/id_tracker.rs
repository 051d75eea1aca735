//! Per-conversation maximum message id.
//!
//! A single sealed record per (conversation, user) holding the largest
//! id ever merged. The bump is monotonic: stale batches can never move
//! it backward.

use std::sync::Arc;

use banter_types::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Serialize};

use crate::backend::{DbKey, KvBackend, Namespace};
use crate::context::Context;
use crate::errors::{Result, StorageError};
use crate::seal::{RecordKind, Sealer};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct MaxMsgIdRecord {
    max_msg_id: MessageId,
}

pub(crate) struct MsgIdTracker {
    backend: Arc<dyn KvBackend>,
}

fn db_key(conv_id: &ConversationId, uid: &UserId) -> DbKey {
    DbKey::new(Namespace::ChatIdTracker, format!("idt:{uid}:{conv_id}"))
}

impl MsgIdTracker {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// The stored maximum, or a miss if this conversation has none yet.
    pub fn get_max_message_id(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> Result<MessageId> {
        let key = db_key(conv_id, uid);
        match self.backend.get(ctx, &key)? {
            None => Err(StorageError::Miss {
                msg_id: MessageId::NONE,
            }),
            Some(raw) => {
                let rec: MaxMsgIdRecord = sealer.open(RecordKind::MaxMsgId, key.key.as_bytes(), &raw)?;
                Ok(rec.max_msg_id)
            }
        }
    }

    /// Raises the stored maximum to `msg_id` if it is larger.
    pub fn bump_max_message_id(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        msg_id: MessageId,
    ) -> Result<()> {
        match self.get_max_message_id(ctx, sealer, conv_id, uid) {
            Ok(cur) if cur >= msg_id => return Ok(()),
            Ok(_) => {}
            Err(err) if err.is_miss() => {}
            Err(err) => return Err(err),
        }

        let key = db_key(conv_id, uid);
        let rec = MaxMsgIdRecord { max_msg_id: msg_id };
        let sealed = sealer.seal(RecordKind::MaxMsgId, key.key.as_bytes(), &rec)?;
        self.backend.put(ctx, &key, &sealed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Block-structured message persistence.
//!
//! Messages are grouped into fixed-size blocks of 100 consecutive ids;
//! a message's block is `id / 100`. Each block is one sealed backend
//! value holding a sparse id → message map, so a single write touches
//! at most a handful of values and a descending read can walk blocks
//! from the seek point toward id 1.
//!
//! A per-conversation index record tracks the highest block ever
//! created. A missing index means the conversation has no local data at
//! all and reads report a miss; a malformed index means corruption.

use std::collections::BTreeMap;
use std::sync::Arc;

use banter_types::{ConversationId, MessageId, MessageUnboxed, UserId};
use serde::{Deserialize, Serialize};

use crate::backend::{DbKey, KvBackend, Namespace};
use crate::collectors::ResultCollector;
use crate::context::Context;
use crate::errors::{Result, StorageError};
use crate::seal::{RecordKind, Sealer};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Messages per block.
pub const BLOCK_SIZE: u64 = 100;

/// Current block index record version.
const BLOCK_INDEX_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-conversation index record.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockIndex {
    version: u32,
    conv_id: ConversationId,
    uid: UserId,
    /// Highest block id ever created for this conversation.
    max_block: u64,
}

/// One block: a sparse map from message id to message.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Block {
    block_id: u64,
    msgs: BTreeMap<u64, MessageUnboxed>,
}

impl Block {
    fn empty(block_id: u64) -> Self {
        Self {
            block_id,
            msgs: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

/// Per-operation engine state produced by [`StorageEngine::init`]:
/// the derived sealer plus the conversation's index as of init time.
pub struct EngineContext {
    sealer: Sealer,
    index: Option<BlockIndex>,
}

impl EngineContext {
    /// Creates a context with no cached index.
    pub fn new(sealer: Sealer) -> Self {
        Self {
            sealer,
            index: None,
        }
    }

    /// The sealer derived for this operation.
    pub fn sealer(&self) -> &Sealer {
        &self.sealer
    }
}

// ---------------------------------------------------------------------------
// StorageEngine
// ---------------------------------------------------------------------------

/// Contract between the merge/query layer and message persistence.
pub trait StorageEngine: Send + Sync {
    /// Prepares an encryption context scoped to `(conv_id, uid)` from
    /// the 32-byte secret-box key. Subsequent reads and writes must use
    /// the returned context.
    fn init(
        &self,
        ctx: &Context,
        key: &[u8; 32],
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> Result<EngineContext>;

    /// Stores each message at its id, overwriting any prior record.
    /// Idempotent for byte-identical inputs.
    fn write_messages(
        &self,
        ctx: &Context,
        ectx: &mut EngineContext,
        conv_id: &ConversationId,
        uid: &UserId,
        msgs: &[MessageUnboxed],
    ) -> Result<()>;

    /// Streams messages in strictly descending id order starting at
    /// `max_id`, pushing stored messages and offering placeholders for
    /// gaps, until the collector is done or id 1 has been passed.
    /// Terminal errors are filtered through the collector before being
    /// returned.
    fn read_messages(
        &self,
        ctx: &Context,
        ectx: &EngineContext,
        rc: &mut dyn ResultCollector,
        conv_id: &ConversationId,
        uid: &UserId,
        max_id: MessageId,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// BlockEngine
// ---------------------------------------------------------------------------

/// The block-structured [`StorageEngine`] implementation.
pub struct BlockEngine {
    backend: Arc<dyn KvBackend>,
}

/// Backend key of the index record: `bi:<hex uid>:<hex conv>`.
pub(crate) fn block_index_key(conv_id: &ConversationId, uid: &UserId) -> DbKey {
    DbKey::new(Namespace::ChatBlockIndex, format!("bi:{uid}:{conv_id}"))
}

fn block_key(conv_id: &ConversationId, uid: &UserId, block_id: u64) -> DbKey {
    DbKey::new(
        Namespace::ChatBlocks,
        format!("bl:{uid}:{conv_id}:{block_id}"),
    )
}

fn block_number(id: u64) -> u64 {
    id / BLOCK_SIZE
}

impl BlockEngine {
    /// Creates an engine over `backend`.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn fetch_block_index(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> Result<Option<BlockIndex>> {
        let key = block_index_key(conv_id, uid);
        let raw = match self.backend.get(ctx, &key)? {
            None => return Ok(None),
            Some(raw) => raw,
        };
        let bi: BlockIndex = sealer.open(RecordKind::BlockIndex, key.key.as_bytes(), &raw)?;
        if bi.version != BLOCK_INDEX_VERSION {
            return Err(StorageError::Corrupt {
                msg: format!(
                    "block index version {} not understood (current: {BLOCK_INDEX_VERSION})",
                    bi.version
                ),
            });
        }
        Ok(Some(bi))
    }

    fn write_block_index(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        bi: &BlockIndex,
    ) -> Result<()> {
        let key = block_index_key(conv_id, uid);
        let sealed = sealer.seal(RecordKind::BlockIndex, key.key.as_bytes(), bi)?;
        self.backend.put(ctx, &key, &sealed)
    }

    fn fetch_block(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        block_id: u64,
    ) -> Result<Option<Block>> {
        let key = block_key(conv_id, uid, block_id);
        match self.backend.get(ctx, &key)? {
            None => Ok(None),
            Some(raw) => {
                let block: Block = sealer.open(RecordKind::Block, key.key.as_bytes(), &raw)?;
                if block.block_id != block_id {
                    return Err(StorageError::Corrupt {
                        msg: format!(
                            "block {} stored under key for block {block_id}",
                            block.block_id
                        ),
                    });
                }
                Ok(Some(block))
            }
        }
    }

    fn write_block(
        &self,
        ctx: &Context,
        sealer: &Sealer,
        conv_id: &ConversationId,
        uid: &UserId,
        block: &Block,
    ) -> Result<()> {
        let key = block_key(conv_id, uid, block.block_id);
        let sealed = sealer.seal(RecordKind::Block, key.key.as_bytes(), block)?;
        self.backend.put(ctx, &key, &sealed)
    }

    fn read_messages_inner(
        &self,
        ctx: &Context,
        ectx: &EngineContext,
        rc: &mut dyn ResultCollector,
        conv_id: &ConversationId,
        uid: &UserId,
        max_id: MessageId,
    ) -> Result<()> {
        ctx.check()?;
        let index = ectx.index.as_ref().ok_or(StorageError::Miss { msg_id: max_id })?;
        if block_number(max_id.value()) > index.max_block {
            return Err(StorageError::Miss { msg_id: max_id });
        }

        let mut cached: Option<(u64, Option<Block>)> = None;
        let mut id = max_id.value();
        while id >= 1 && !rc.done() {
            ctx.check()?;
            let bl = block_number(id);
            if !matches!(cached, Some((cached_id, _)) if cached_id == bl) {
                cached = Some((bl, self.fetch_block(ctx, &ectx.sealer, conv_id, uid, bl)?));
            }
            let slot = cached
                .as_ref()
                .and_then(|(_, block)| block.as_ref())
                .and_then(|block| block.msgs.get(&id));
            match slot {
                Some(MessageUnboxed::Outbox(_)) => {
                    return Err(StorageError::Corrupt {
                        msg: format!("outbox record stored at id {id}"),
                    });
                }
                Some(msg) => rc.push(msg.clone()),
                None => {
                    if !rc.push_placeholder(MessageId::new(id)) {
                        return Err(StorageError::Miss {
                            msg_id: MessageId::new(id),
                        });
                    }
                }
            }
            id -= 1;
        }
        Ok(())
    }
}

impl StorageEngine for BlockEngine {
    fn init(
        &self,
        ctx: &Context,
        key: &[u8; 32],
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> Result<EngineContext> {
        ctx.check()?;
        let sealer = Sealer::derive(key, conv_id, uid)?;
        let index = self.fetch_block_index(ctx, &sealer, conv_id, uid)?;
        Ok(EngineContext { sealer, index })
    }

    fn write_messages(
        &self,
        ctx: &Context,
        ectx: &mut EngineContext,
        conv_id: &ConversationId,
        uid: &UserId,
        msgs: &[MessageUnboxed],
    ) -> Result<()> {
        ctx.check()?;
        if msgs.is_empty() {
            return Ok(());
        }

        // Group the batch by block, rejecting anything unstorable.
        let mut by_block: BTreeMap<u64, Vec<&MessageUnboxed>> = BTreeMap::new();
        for msg in msgs {
            let id = msg.message_id();
            if id.is_none() {
                return Err(StorageError::Internal {
                    msg: "cannot store a message with the null id".into(),
                });
            }
            if matches!(msg, MessageUnboxed::Outbox(_)) {
                return Err(StorageError::Internal {
                    msg: format!("refusing to store an outbox record at id {id}"),
                });
            }
            by_block.entry(block_number(id.value())).or_default().push(msg);
        }

        // Create or extend the index before touching any block, so a
        // partially written batch still has every block reachable.
        let (mut index, created) = match ectx.index.take() {
            Some(index) => (index, false),
            None => (
                BlockIndex {
                    version: BLOCK_INDEX_VERSION,
                    conv_id: conv_id.clone(),
                    uid: uid.clone(),
                    max_block: 0,
                },
                true,
            ),
        };
        let highest = by_block
            .keys()
            .next_back()
            .copied()
            .unwrap_or(index.max_block);
        if created || highest > index.max_block {
            index.max_block = index.max_block.max(highest);
            self.write_block_index(ctx, &ectx.sealer, conv_id, uid, &index)?;
        }
        ectx.index = Some(index);

        for (block_id, batch) in by_block {
            let mut block = self
                .fetch_block(ctx, &ectx.sealer, conv_id, uid, block_id)?
                .unwrap_or_else(|| Block::empty(block_id));
            for msg in batch {
                block.msgs.insert(msg.message_id().value(), msg.clone());
            }
            self.write_block(ctx, &ectx.sealer, conv_id, uid, &block)?;
        }
        Ok(())
    }

    fn read_messages(
        &self,
        ctx: &Context,
        ectx: &EngineContext,
        rc: &mut dyn ResultCollector,
        conv_id: &ConversationId,
        uid: &UserId,
        max_id: MessageId,
    ) -> Result<()> {
        match self.read_messages_inner(ctx, ectx, rc, conv_id, uid, max_id) {
            Ok(()) => Ok(()),
            Err(err) => match rc.error(err) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

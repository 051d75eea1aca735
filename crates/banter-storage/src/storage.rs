//! The merge/query engine and lock/nuke supervisor.
//!
//! [`Storage`] is the public face of the conversation cache. Every
//! public operation takes the process-wide storage lock, fetches the
//! secret-box key, initializes the engine for (conversation, user), and
//! runs against the block store and trackers. Private helpers assume
//! the lock is held by their caller and never re-acquire it.
//!
//! Corruption discovered anywhere in an operation routes the error
//! through [`Storage::maybe_nuke`], which clears the conversation's
//! block index (or, failing that, the whole local database) before
//! handing the original error back to the caller.

use std::sync::{Arc, Mutex, MutexGuard};

use banter_types::{
    is_deletable_by_delete_history, supersedes_of, Conversation, ConversationId, GetThreadQuery,
    MessageBody, MessageDeleteHistory, MessageId, MessageType, MessageUnboxed, MessageValid,
    Pagination, ThreadView, UserId,
};
use tracing::{debug, error, warn};

use crate::backend::KvBackend;
use crate::block_engine::{block_index_key, BlockEngine, EngineContext, StorageEngine};
use crate::codec;
use crate::collectors::{
    InsatiableResultCollector, ResultCollector, SimpleResultCollector, TypedResultCollector,
};
use crate::context::Context;
use crate::delh_tracker::DelhTracker;
use crate::errors::{Result, StorageError};
use crate::id_tracker::MsgIdTracker;
use crate::pager;
use crate::seal::Sealer;
use crate::secret_key::SecretKeyProvider;

// ---------------------------------------------------------------------------
// Constants / lock
// ---------------------------------------------------------------------------

/// Cap on how many messages a single fetch may return.
const MAX_FETCH_NUM: usize = 10000;

/// Process-wide lock making storage access single threaded. Public
/// functions take it; private functions must never be called without it.
static STORAGE_LOCK: Mutex<()> = Mutex::new(());

fn lock_storage() -> MutexGuard<'static, ()> {
    STORAGE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// MergeResult
// ---------------------------------------------------------------------------

/// Outcome of a [`Storage::merge`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MergeResult {
    /// Whether the merge applied a delete-history to local messages.
    pub deleted_history: bool,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// The per-conversation local message store.
pub struct Storage {
    backend: Arc<dyn KvBackend>,
    engine: Box<dyn StorageEngine>,
    idtracker: MsgIdTracker,
    delh_tracker: DelhTracker,
    key_provider: Arc<dyn SecretKeyProvider>,
}

impl Storage {
    /// Creates a store over `backend`, sealing with keys from
    /// `key_provider`, using the block engine.
    pub fn new(backend: Arc<dyn KvBackend>, key_provider: Arc<dyn SecretKeyProvider>) -> Self {
        Self::with_engine(
            backend.clone(),
            key_provider,
            Box::new(BlockEngine::new(backend)),
        )
    }

    /// Creates a store with a caller-supplied engine.
    pub fn with_engine(
        backend: Arc<dyn KvBackend>,
        key_provider: Arc<dyn SecretKeyProvider>,
        engine: Box<dyn StorageEngine>,
    ) -> Self {
        Self {
            engine,
            idtracker: MsgIdTracker::new(backend.clone()),
            delh_tracker: DelhTracker::new(backend.clone()),
            backend,
            key_provider,
        }
    }

    fn secret_box_key(&self, ctx: &Context) -> Result<[u8; 32]> {
        self.key_provider
            .secret_box_key(ctx)
            .map_err(|e| StorageError::Misc {
                msg: format!("unable to get secret key: {e}"),
            })
    }

    /// Clears the conversation's block index when `err` says the cache
    /// can no longer be trusted (or when forced). If even the index
    /// delete fails, the entire local database is nuked; if that fails
    /// too the process aborts, because no further state can be saved.
    /// Always returns the original error.
    pub fn maybe_nuke(
        &self,
        ctx: &Context,
        force: bool,
        err: StorageError,
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> StorageError {
        if force || err.should_clear() {
            warn!(conv = %conv_id, "chat local storage corrupted: clearing");
            if let Err(derr) = self.backend.delete(ctx, &block_index_key(conv_id, uid)) {
                error!(%derr, "failed to delete chat index, clearing entire local database");
                if let Err(nerr) = self.backend.nuke(ctx) {
                    panic!("unable to clear local chat storage: {nerr}");
                }
            }
        }
        err
    }

    /// The largest message id ever merged for (conversation, user).
    pub fn get_max_msg_id(
        &self,
        ctx: &Context,
        conv_id: &ConversationId,
        uid: &UserId,
    ) -> Result<MessageId> {
        let _guard = lock_storage();

        let key = self.secret_box_key(ctx)?;
        let sealer = Sealer::derive(&key, conv_id, uid)?;
        self.idtracker
            .get_max_message_id(ctx, &sealer, conv_id, uid)
            .map_err(|err| self.maybe_nuke(ctx, false, err, conv_id, uid))
    }

    /// Ingests a batch of server-authoritative messages and restores the
    /// derived invariants: supersedes pointers, the min-deletable
    /// watermark, delete-history horizons, and the max message id.
    ///
    /// `msgs` must be sorted by descending message id.
    pub fn merge(
        &self,
        ctx: &Context,
        conv_id: &ConversationId,
        uid: &UserId,
        msgs: &[MessageUnboxed],
    ) -> Result<MergeResult> {
        // All public functions get the lock to make access to the
        // database single threaded. They should never be called from
        // private functions.
        let _guard = lock_storage();

        debug!(conv = %conv_id, uid = %uid, num = msgs.len(), "merge");

        let key = self.secret_box_key(ctx)?;
        let mut ectx = match self.engine.init(ctx, &key, conv_id, uid) {
            Ok(ectx) => ectx,
            Err(err) => return Err(self.maybe_nuke(ctx, false, err, conv_id, uid)),
        };

        // Write out new data into blocks.
        if let Err(err) = self.engine.write_messages(ctx, &mut ectx, conv_id, uid, msgs) {
            return Err(self.maybe_nuke(ctx, false, err, conv_id, uid));
        }

        // Update superseded-by pointers.
        if let Err(err) = self.update_all_superseded_by(ctx, &mut ectx, conv_id, uid, msgs) {
            return Err(self.maybe_nuke(ctx, false, err, conv_id, uid));
        }

        if let Err(err) = self.update_min_deletable_message(ctx, &ectx, conv_id, uid, msgs) {
            return Err(self.maybe_nuke(ctx, false, err, conv_id, uid));
        }

        // Process any delete-history directives.
        let deleted_history = match self.handle_delete_history(ctx, &mut ectx, conv_id, uid, msgs)
        {
            Ok(deleted) => deleted,
            Err(err) => return Err(self.maybe_nuke(ctx, false, err, conv_id, uid)),
        };

        // Update the max message id if needed. The batch is sorted
        // descending, so the first entry is the largest.
        if let Some(first) = msgs.first() {
            if let Err(err) = self.idtracker.bump_max_message_id(
                ctx,
                ectx.sealer(),
                conv_id,
                uid,
                first.message_id(),
            ) {
                return Err(self.maybe_nuke(ctx, false, err, conv_id, uid));
            }
        }

        Ok(MergeResult { deleted_history })
    }

    fn update_all_superseded_by(
        &self,
        ctx: &Context,
        ectx: &mut EngineContext,
        conv_id: &ConversationId,
        uid: &UserId,
        msgs: &[MessageUnboxed],
    ) -> Result<()> {
        debug!(num = msgs.len(), "supersedes: updating pointers");

        // One pass over the batch, applying each superseder to the
        // messages it targets.
        for msg in msgs {
            let msg_id = msg.message_id();
            let mvalid = match msg {
                MessageUnboxed::Valid(v) => v,
                _ => {
                    debug!(id = %msg_id, "supersedes: skipping potential superseder marked as error");
                    continue;
                }
            };

            let superseded_ids = supersedes_of(mvalid);
            if !superseded_ids.is_empty() {
                debug!(id = %msg_id, targets = ?superseded_ids, "supersedes: applying");
            }

            for superseded_id in superseded_ids {
                // Read the superseded message.
                let mut rc = SimpleResultCollector::new(1);
                match self
                    .engine
                    .read_messages(ctx, ectx, &mut rc, conv_id, uid, superseded_id)
                {
                    Ok(()) => {}
                    // If we don't have the target, just keep going.
                    Err(err) if err.is_miss() => continue,
                    Err(err) => return Err(err),
                }
                let targets = rc.result();
                let target = match targets.first() {
                    Some(target) => target,
                    None => continue,
                };

                // Update superseded-by on the target if we have it. And
                // if the superseder is a deletion, delete the body too.
                match target {
                    MessageUnboxed::Valid(tvalid) => {
                        debug!(id = %msg_id, superseded = %superseded_id, "supersedes: writing");
                        let mut updated = tvalid.clone();
                        updated.server_header.superseded_by = msg_id;
                        if mvalid.message_type() == MessageType::Delete {
                            updated.body = None;
                        }
                        self.engine.write_messages(
                            ctx,
                            ectx,
                            conv_id,
                            uid,
                            &[MessageUnboxed::Valid(updated)],
                        )?;
                    }
                    _ => {
                        debug!(
                            id = %target.message_id(),
                            "supersedes: skipping target stored as error"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    fn update_min_deletable_message(
        &self,
        ctx: &Context,
        ectx: &EngineContext,
        conv_id: &ConversationId,
        uid: &UserId,
        msgs: &[MessageUnboxed],
    ) -> Result<()> {
        // The min deletable message id in this new batch of messages.
        let mut batch_min: Option<MessageId> = None;
        for msg in msgs {
            let mvalid = match msg {
                MessageUnboxed::Valid(v) => v,
                _ => {
                    debug!(id = %msg.message_id(), "min-deletable: skipping message marked as error");
                    continue;
                }
            };
            if !is_deletable_by_delete_history(mvalid.message_type()) {
                continue;
            }
            if mvalid.body.is_none() {
                continue;
            }
            let msg_id = mvalid.message_id();
            if batch_min.map_or(true, |min| msg_id < min) {
                batch_min = Some(msg_id);
            }
        }
        let batch_min = match batch_min {
            Some(min) => min,
            None => return Ok(()),
        };

        // Update the tracker to min(stored, batch).
        match self
            .delh_tracker
            .get_entry(ctx, ectx.sealer(), conv_id, uid)
        {
            Ok(mem) => {
                if !mem.min_deletable_message.is_none() && batch_min >= mem.min_deletable_message {
                    // no need to update
                    return Ok(());
                }
            }
            // We have no memory.
            Err(err) if err.is_miss() => {}
            Err(err) => return Err(err),
        }

        if let Err(err) =
            self.delh_tracker
                .set_min_deletable_message(ctx, ectx.sealer(), conv_id, uid, batch_min)
        {
            debug!(%err, "min-deletable: failed to store tracker entry");
        }
        Ok(())
    }

    /// Applies any new delete-history from the batch. Returns whether
    /// local deletes happened. Short-circuits, so it is cheap to call on
    /// every merge.
    fn handle_delete_history(
        &self,
        ctx: &Context,
        ectx: &mut EngineContext,
        conv_id: &ConversationId,
        uid: &UserId,
        msgs: &[MessageUnboxed],
    ) -> Result<bool> {
        // Find the delete-history message with the maximum upto value.
        let mut active: Option<(&MessageValid, MessageDeleteHistory)> = None;
        for msg in msgs {
            let mvalid = match msg {
                MessageUnboxed::Valid(v) => v,
                _ => {
                    debug!(id = %msg.message_id(), "delete-history: skipping message marked as error");
                    continue;
                }
            };
            if mvalid.message_type() != MessageType::DeleteHistory {
                continue;
            }
            let delh = match &mvalid.body {
                Some(MessageBody::DeleteHistory(delh)) => *delh,
                Some(other) => {
                    debug!(
                        body_type = %other.message_type(),
                        "delete-history: skipping wrong message body type"
                    );
                    continue;
                }
                None => {
                    debug!(id = %mvalid.message_id(), "delete-history: skipping blanked body");
                    continue;
                }
            };
            debug!(id = %mvalid.message_id(), upto = %delh.upto, "delete-history: found directive");
            if delh.upto.is_none() {
                debug!("delete-history: skipping malformed directive");
                continue;
            }
            if active.map_or(true, |(_, cur)| delh.upto > cur.upto) {
                active = Some((mvalid, delh));
            }
        }

        // Noop if there are no delete-history messages.
        let (source, delh) = match active {
            Some(active) => active,
            None => return Ok(false),
        };

        match self
            .delh_tracker
            .get_entry(ctx, ectx.sealer(), conv_id, uid)
        {
            Ok(mem) => {
                if mem.max_delete_history_upto >= delh.upto {
                    // No-op if the effect has already been applied locally.
                    debug!(
                        local = %mem.max_delete_history_upto,
                        upto = %delh.upto,
                        "delete-history: skipping directive with no new effect"
                    );
                    return Ok(false);
                }
                if delh.upto < mem.min_deletable_message {
                    // Record-only if it would delete messages earlier
                    // than the local min.
                    debug!(
                        upto = %delh.upto,
                        min = %mem.min_deletable_message,
                        "delete-history: record-only directive"
                    );
                    if let Err(err) = self.delh_tracker.set_max_delete_history_upto(
                        ctx,
                        ectx.sealer(),
                        conv_id,
                        uid,
                        delh.upto,
                    ) {
                        debug!(%err, "delete-history: failed to store tracker entry");
                    }
                    return Ok(false);
                }
                // No shortcuts; fall through to apply.
            }
            // We have no memory, assume it needs to be applied.
            Err(err) if err.is_miss() => {}
            Err(err) => return Err(err),
        }

        self.apply_delete_history(ctx, ectx, conv_id, uid, source, delh)
    }

    /// Runs a delete-history over all local messages below its horizon.
    /// Returns whether local deletes happened.
    fn apply_delete_history(
        &self,
        ctx: &Context,
        ectx: &mut EngineContext,
        conv_id: &ConversationId,
        uid: &UserId,
        source: &MessageValid,
        delh: MessageDeleteHistory,
    ) -> Result<bool> {
        debug!(conv = %conv_id, uid = %uid, upto = %delh.upto, "delete-history: applying");

        // Collect every message strictly below the horizon.
        let mut rc = InsatiableResultCollector::new();
        let scan_top = MessageId::new(delh.upto.value() - 1);
        match self
            .engine
            .read_messages(ctx, ectx, &mut rc, conv_id, uid, scan_top)
        {
            Ok(()) => {}
            Err(err) if err.is_miss() => {
                debug!("delete-history: record-only, no local messages");
                if let Err(err) = self.delh_tracker.set_max_delete_history_upto(
                    ctx,
                    ectx.sealer(),
                    conv_id,
                    uid,
                    delh.upto,
                ) {
                    debug!(%err, "delete-history: failed to store tracker entry");
                }
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        let mut writeback = Vec::new();
        for msg in rc.result() {
            if !is_deletable_by_delete_history(msg.message_type()) {
                // Skip message types that cannot be deleted this way.
                continue;
            }
            let mvalid = match msg {
                MessageUnboxed::Valid(v) => v,
                other => {
                    debug!(id = %other.message_id(), "delete-history: skipping invalid message");
                    continue;
                }
            };
            if mvalid.body.is_none() {
                debug!(id = %mvalid.message_id(), "delete-history: skipping already deleted message");
                continue;
            }
            let mut updated = mvalid;
            updated.server_header.superseded_by = source.message_id();
            updated.body = None;
            writeback.push(MessageUnboxed::Valid(updated));
        }
        debug!(num = writeback.len(), "delete-history: deleting messages");

        self.engine
            .write_messages(ctx, ectx, conv_id, uid, &writeback)?;

        if let Err(err) =
            self.delh_tracker
                .set_deleted_upto(ctx, ectx.sealer(), conv_id, uid, delh.upto)
        {
            debug!(%err, "delete-history: failed to store tracker entry");
        }

        Ok(true)
    }

    /// Chooses the stop policy for a fetch that did not bring its own
    /// collector: a typed count when the query filters by type, a plain
    /// count otherwise.
    pub fn result_collector_from_query(
        &self,
        query: Option<&GetThreadQuery>,
        pagination: Option<&Pagination>,
    ) -> Box<dyn ResultCollector> {
        let num = pagination.map_or(MAX_FETCH_NUM, |p| p.num) as isize;

        match query {
            Some(query) if !query.message_types.is_empty() => {
                debug!(types = ?query.message_types, "collector from query: typed");
                Box::new(TypedResultCollector::new(
                    num,
                    query.message_types.iter().copied(),
                ))
            }
            _ => Box::new(SimpleResultCollector::new(num)),
        }
    }

    fn fetch_up_to_msg_id_locked(
        &self,
        ctx: &Context,
        key: &[u8; 32],
        rc: Option<&mut dyn ResultCollector>,
        conv_id: &ConversationId,
        uid: &UserId,
        msg_id: MessageId,
        query: Option<&GetThreadQuery>,
        pagination: Option<&Pagination>,
    ) -> Result<ThreadView> {
        let ectx = match self.engine.init(ctx, key, conv_id, uid) {
            Ok(ectx) => ectx,
            Err(err) => return Err(self.maybe_nuke(ctx, false, err, conv_id, uid)),
        };

        // Calculate seek parameters.
        let (max_id, num) = match pagination {
            None => (msg_id, MAX_FETCH_NUM),
            Some(page) => {
                let num = page.num;
                if page.next.is_empty() && page.previous.is_empty() {
                    (msg_id, num)
                } else if !page.next.is_empty() {
                    let pid: MessageId = match codec::decode(&page.next) {
                        Ok(pid) => pid,
                        Err(err) => {
                            let err = StorageError::Remote {
                                msg: format!("fetch: failed to decode pager cursor: {err}"),
                            };
                            return Err(self.maybe_nuke(ctx, false, err, conv_id, uid));
                        }
                    };
                    debug!(pid = %pid, "fetch: next pagination");
                    (MessageId::new(pid.value().saturating_sub(1)), num)
                } else {
                    let pid: MessageId = match codec::decode(&page.previous) {
                        Ok(pid) => pid,
                        Err(err) => {
                            let err = StorageError::Remote {
                                msg: format!("fetch: failed to decode pager cursor: {err}"),
                            };
                            return Err(self.maybe_nuke(ctx, false, err, conv_id, uid));
                        }
                    };
                    debug!(pid = %pid, "fetch: prev pagination");
                    (MessageId::new(pid.value() + num as u64), num)
                }
            }
        };
        debug!(max_id = %max_id, num, "fetch");

        // Figure out how to determine we are done seeking, unless the
        // caller brought its own policy.
        let mut constructed: Option<Box<dyn ResultCollector>> = None;
        let rc: &mut dyn ResultCollector = match rc {
            Some(rc) => rc,
            None => constructed
                .insert(self.result_collector_from_query(query, pagination))
                .as_mut(),
        };
        debug!(collector = %rc, "fetch: using result collector");

        // Run the seek.
        if let Err(err) = self.engine.read_messages(ctx, &ectx, rc, conv_id, uid, max_id) {
            return Err(self.maybe_nuke(ctx, false, err, conv_id, uid));
        }
        let messages = rc.result();

        // Form the paged result.
        let pagination = match pager::make_page(&messages, num) {
            Ok(page) => page,
            Err(err) => {
                return Err(StorageError::Internal {
                    msg: format!("fetch: failed to encode pager: {err}"),
                })
            }
        };

        debug!(num = messages.len(), "fetch: cache hit");
        Ok(ThreadView {
            messages,
            pagination,
        })
    }

    /// Fetches one page of the thread, seeded at the server's max id
    /// for the conversation.
    pub fn fetch(
        &self,
        ctx: &Context,
        conv: &Conversation,
        uid: &UserId,
        rc: Option<&mut dyn ResultCollector>,
        query: Option<&GetThreadQuery>,
        pagination: Option<&Pagination>,
    ) -> Result<ThreadView> {
        // All public functions get the lock to make access to the
        // database single threaded. They should never be called from
        // private functions.
        let _guard = lock_storage();

        let key = self.secret_box_key(ctx)?;
        self.fetch_up_to_msg_id_locked(
            ctx,
            &key,
            rc,
            &conv.metadata.conversation_id,
            uid,
            conv.reader_info.max_msgid,
            query,
            pagination,
        )
    }

    /// Fetches one page of the thread, seeded at the locally tracked
    /// max id instead of the server's.
    pub fn fetch_up_to_local_max_msg_id(
        &self,
        ctx: &Context,
        conv_id: &ConversationId,
        uid: &UserId,
        rc: Option<&mut dyn ResultCollector>,
        query: Option<&GetThreadQuery>,
        pagination: Option<&Pagination>,
    ) -> Result<ThreadView> {
        let _guard = lock_storage();

        let key = self.secret_box_key(ctx)?;
        let sealer = Sealer::derive(&key, conv_id, uid)?;
        let max_msg_id = self
            .idtracker
            .get_max_message_id(ctx, &sealer, conv_id, uid)?;
        debug!(max_msg_id = %max_msg_id, "fetch up to local max");

        self.fetch_up_to_msg_id_locked(ctx, &key, rc, conv_id, uid, max_msg_id, query, pagination)
    }

    /// Fetches individual messages by id. The result has one slot per
    /// requested id; a slot is `None` when that id is not stored.
    pub fn fetch_messages(
        &self,
        ctx: &Context,
        conv_id: &ConversationId,
        uid: &UserId,
        msg_ids: &[MessageId],
    ) -> Result<Vec<Option<MessageUnboxed>>> {
        let _guard = lock_storage();

        let key = self.secret_box_key(ctx)?;
        let ectx = match self.engine.init(ctx, &key, conv_id, uid) {
            Ok(ectx) => ectx,
            Err(err) => return Err(self.maybe_nuke(ctx, false, err, conv_id, uid)),
        };

        let mut res = Vec::with_capacity(msg_ids.len());
        for &msg_id in msg_ids {
            let mut rc = SimpleResultCollector::new(1);
            match self
                .engine
                .read_messages(ctx, &ectx, &mut rc, conv_id, uid, msg_id)
            {
                Ok(()) => res.push(rc.result().into_iter().next()),
                Err(err) if err.is_miss() => res.push(None),
                Err(err) => return Err(self.maybe_nuke(ctx, false, err, conv_id, uid)),
            }
        }

        Ok(res)
    }
}

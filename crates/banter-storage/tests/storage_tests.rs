//! Integration tests for the conversation store.
//!
//! All tests are deterministic — no real-time sleeps, fixed timestamps,
//! fixed keys, and a fresh temp-dir sled database per test.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use banter_storage::codec;
use banter_storage::{
    Context, DbKey, HoleyResultCollector, KvBackend, Namespace, SimpleResultCollector,
    SledBackend, StaticKeyProvider, Storage, StorageError,
};
use banter_types::{
    Conversation, ConversationId, ConversationMetadata, ConversationReaderInfo, GetThreadQuery,
    MessageBody, MessageClientHeader, MessageDelete, MessageDeleteHistory, MessageEdit,
    MessageError, MessageHeadline, MessageId, MessageServerHeader, MessageText, MessageType,
    MessageUnboxed, MessageValid, Pagination, UserId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns a unique temporary directory for each test.
fn temp_dir() -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "banter-storage-test-{}-{}-{}",
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

const TEST_KEY: [u8; 32] = [0x42u8; 32];

struct Harness {
    storage: Storage,
    backend: Arc<SledBackend>,
    ctx: Context,
    conv_id: ConversationId,
    uid: UserId,
}

fn setup() -> Harness {
    let backend = Arc::new(SledBackend::open(&temp_dir()).expect("open backend"));
    let storage = Storage::new(
        backend.clone(),
        Arc::new(StaticKeyProvider::new(TEST_KEY)),
    );
    Harness {
        storage,
        backend,
        ctx: Context::background(),
        conv_id: ConversationId::new(&b"conv-tests"[..]),
        uid: UserId::new(&b"user-tests"[..]),
    }
}

fn ctime() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
}

fn valid(id: u64, typ: MessageType, body: Option<MessageBody>) -> MessageUnboxed {
    MessageUnboxed::Valid(MessageValid {
        server_header: MessageServerHeader {
            message_id: MessageId::new(id),
            superseded_by: MessageId::NONE,
            ctime: ctime(),
        },
        client_header: MessageClientHeader {
            sender: UserId::new(&b"sender"[..]),
            message_type: typ,
        },
        body,
    })
}

fn text(id: u64, body: &str) -> MessageUnboxed {
    valid(
        id,
        MessageType::Text,
        Some(MessageBody::Text(MessageText { body: body.into() })),
    )
}

fn headline(id: u64, headline: &str) -> MessageUnboxed {
    valid(
        id,
        MessageType::Headline,
        Some(MessageBody::Headline(MessageHeadline {
            headline: headline.into(),
        })),
    )
}

fn delete(id: u64, targets: &[u64]) -> MessageUnboxed {
    valid(
        id,
        MessageType::Delete,
        Some(MessageBody::Delete(MessageDelete {
            message_ids: targets.iter().map(|&t| MessageId::new(t)).collect(),
        })),
    )
}

fn edit(id: u64, target: u64, body: &str) -> MessageUnboxed {
    valid(
        id,
        MessageType::Edit,
        Some(MessageBody::Edit(MessageEdit {
            message_id: MessageId::new(target),
            body: body.into(),
        })),
    )
}

fn delete_history(id: u64, upto: u64) -> MessageUnboxed {
    valid(
        id,
        MessageType::DeleteHistory,
        Some(MessageBody::DeleteHistory(MessageDeleteHistory {
            upto: MessageId::new(upto),
        })),
    )
}

fn conversation(conv_id: &ConversationId, max_msgid: u64) -> Conversation {
    Conversation {
        metadata: ConversationMetadata {
            conversation_id: conv_id.clone(),
        },
        reader_info: ConversationReaderInfo {
            max_msgid: MessageId::new(max_msgid),
        },
    }
}

/// Fetches up to `num` messages from `max_id` down and returns them.
fn fetch_thread(h: &Harness, max_id: u64, num: isize) -> Vec<MessageUnboxed> {
    let mut rc = SimpleResultCollector::new(num);
    h.storage
        .fetch(
            &h.ctx,
            &conversation(&h.conv_id, max_id),
            &h.uid,
            Some(&mut rc),
            None,
            None,
        )
        .expect("fetch")
        .messages
}

fn fetch_one(h: &Harness, id: u64) -> Option<MessageUnboxed> {
    h.storage
        .fetch_messages(&h.ctx, &h.conv_id, &h.uid, &[MessageId::new(id)])
        .expect("fetch_messages")
        .into_iter()
        .next()
        .flatten()
}

fn ids_of(msgs: &[MessageUnboxed]) -> Vec<u64> {
    msgs.iter().map(|m| m.message_id().value()).collect()
}

fn expect_valid(msg: Option<MessageUnboxed>) -> MessageValid {
    match msg {
        Some(MessageUnboxed::Valid(v)) => v,
        other => panic!("expected a valid message, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Merge and fetch basics
// ---------------------------------------------------------------------------

#[test]
fn merge_then_fetch_descending() {
    let h = setup();
    h.storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[text(3, "c"), text(2, "b"), text(1, "a")],
        )
        .expect("merge");

    let msgs = fetch_thread(&h, 3, 10);
    assert_eq!(ids_of(&msgs), vec![3, 2, 1]);

    let max = h
        .storage
        .get_max_msg_id(&h.ctx, &h.conv_id, &h.uid)
        .expect("max msg id");
    assert_eq!(max, MessageId::new(3));
}

#[test]
fn max_msg_id_tracks_the_largest_ever_merged() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(3, "c"), text(1, "a")])
        .expect("merge");
    // A stale, smaller batch does not move the tracker backward.
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(2, "b")])
        .expect("merge");

    let max = h
        .storage
        .get_max_msg_id(&h.ctx, &h.conv_id, &h.uid)
        .expect("max msg id");
    assert_eq!(max, MessageId::new(3));
}

#[test]
fn max_msg_id_on_fresh_conversation_is_a_miss() {
    let h = setup();
    let res = h.storage.get_max_msg_id(&h.ctx, &h.conv_id, &h.uid);
    assert!(matches!(res, Err(StorageError::Miss { .. })));
}

#[test]
fn merge_of_empty_batch_is_a_noop() {
    let h = setup();
    let res = h
        .storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[])
        .expect("merge");
    assert!(!res.deleted_history);
}

#[test]
fn merge_is_idempotent() {
    let h = setup();
    let batch = [
        delete(4, &[2]),
        text(3, "c"),
        text(2, "b"),
        text(1, "a"),
    ];
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &batch)
        .expect("first merge");
    let first = fetch_thread(&h, 4, 10);

    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &batch)
        .expect("second merge");
    let second = fetch_thread(&h, 4, 10);

    assert_eq!(first, second);
    let max = h
        .storage
        .get_max_msg_id(&h.ctx, &h.conv_id, &h.uid)
        .expect("max msg id");
    assert_eq!(max, MessageId::new(4));
}

// ---------------------------------------------------------------------------
// Supersedes
// ---------------------------------------------------------------------------

#[test]
fn delete_blanks_its_target() {
    let h = setup();
    h.storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[text(3, "c"), text(2, "b"), text(1, "a")],
        )
        .expect("merge");
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete(4, &[2])])
        .expect("merge delete");

    let target = expect_valid(fetch_one(&h, 2));
    assert_eq!(target.server_header.superseded_by, MessageId::new(4));
    assert!(target.body.is_none());

    let deleter = expect_valid(fetch_one(&h, 4));
    assert_eq!(deleter.message_type(), MessageType::Delete);
}

#[test]
fn edit_marks_but_does_not_blank_its_target() {
    let h = setup();
    h.storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[text(3, "c"), text(2, "b"), text(1, "a")],
        )
        .expect("merge");
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[edit(5, 1, "a-prime")])
        .expect("merge edit");

    let target = expect_valid(fetch_one(&h, 1));
    assert_eq!(target.server_header.superseded_by, MessageId::new(5));
    // The replacement text lives on the superseder, not the target.
    match target.body {
        Some(MessageBody::Text(ref t)) => assert_eq!(t.body, "a"),
        ref other => panic!("expected original text body, got {other:?}"),
    }
}

#[test]
fn superseding_an_unknown_target_is_skipped() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(1, "a")])
        .expect("merge");
    // Target 7 was never stored; the merge must not fail.
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete(8, &[7])])
        .expect("merge delete of unknown target");
    assert!(fetch_one(&h, 7).is_none());
}

#[test]
fn superseding_an_error_record_leaves_it_alone() {
    let h = setup();
    let broken = MessageUnboxed::Error(MessageError {
        message_id: MessageId::new(2),
        err_msg: "unboxing failed".into(),
    });
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[broken.clone(), text(1, "a")])
        .expect("merge");
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete(3, &[2])])
        .expect("merge delete");

    assert_eq!(fetch_one(&h, 2), Some(broken));
}

// ---------------------------------------------------------------------------
// Delete-history
// ---------------------------------------------------------------------------

#[test]
fn delete_history_blanks_everything_below_its_horizon() {
    let h = setup();
    h.storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[text(3, "c"), text(2, "b"), text(1, "a")],
        )
        .expect("merge");
    let res = h
        .storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete_history(10, 3)])
        .expect("merge delh");
    assert!(res.deleted_history);

    for id in [1u64, 2] {
        let m = expect_valid(fetch_one(&h, id));
        assert_eq!(m.server_header.superseded_by, MessageId::new(10), "id {id}");
        assert!(m.body.is_none(), "id {id}");
    }

    // The horizon is exclusive: id 3 is untouched.
    let kept = expect_valid(fetch_one(&h, 3));
    assert_eq!(kept.server_header.superseded_by, MessageId::NONE);
    match kept.body {
        Some(MessageBody::Text(ref t)) => assert_eq!(t.body, "c"),
        ref other => panic!("expected intact text body, got {other:?}"),
    }
}

#[test]
fn delete_history_preserves_non_deletable_types() {
    let h = setup();
    h.storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[headline(2, "topic"), text(1, "a")],
        )
        .expect("merge");
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete_history(9, 5)])
        .expect("merge delh");

    let kept = expect_valid(fetch_one(&h, 2));
    assert_eq!(kept.server_header.superseded_by, MessageId::NONE);
    assert!(kept.body.is_some());

    let blanked = expect_valid(fetch_one(&h, 1));
    assert!(blanked.body.is_none());
}

#[test]
fn delete_history_on_empty_store_is_record_only() {
    let h = setup();
    let res = h
        .storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete_history(5, 100)])
        .expect("merge delh");
    assert!(!res.deleted_history);

    // A text below the recorded horizon arrives afterwards.
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(50, "late")])
        .expect("merge text");

    // A directive below the local min deletable id stays record-only.
    let res = h
        .storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete_history(110, 40)])
        .expect("merge delh 40");
    assert!(!res.deleted_history);
    let intact = expect_valid(fetch_one(&h, 50));
    assert!(intact.body.is_some());

    // A directive above it applies.
    let res = h
        .storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete_history(120, 200)])
        .expect("merge delh 200");
    assert!(res.deleted_history);
    let blanked = expect_valid(fetch_one(&h, 50));
    assert!(blanked.body.is_none());
    assert_eq!(blanked.server_header.superseded_by, MessageId::new(120));
}

#[test]
fn stale_delete_history_has_no_new_effect() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(2, "b"), text(1, "a")])
        .expect("merge");
    let res = h
        .storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete_history(10, 3)])
        .expect("merge delh");
    assert!(res.deleted_history);

    // Replaying the same horizon (or a lower one) is a no-op.
    let res = h
        .storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[delete_history(11, 3)])
        .expect("merge stale delh");
    assert!(!res.deleted_history);
}

#[test]
fn malformed_delete_history_is_ignored() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(1, "a")])
        .expect("merge");
    // upto 0 is malformed; a delete-history with a text body disagrees
    // with its header type.
    let bad_body = valid(
        3,
        MessageType::DeleteHistory,
        Some(MessageBody::Text(MessageText { body: "x".into() })),
    );
    let res = h
        .storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[bad_body, delete_history(2, 0)],
        )
        .expect("merge");
    assert!(!res.deleted_history);
    let intact = expect_valid(fetch_one(&h, 1));
    assert!(intact.body.is_some());
}

// ---------------------------------------------------------------------------
// Fetch: pagination, queries, collectors
// ---------------------------------------------------------------------------

#[test]
fn next_cursor_pages_older_messages() {
    let h = setup();
    let msgs: Vec<_> = (1..=20).rev().map(|id| text(id, "m")).collect();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &msgs)
        .expect("merge");

    let pagination = Pagination {
        next: codec::encode(&MessageId::new(10)).expect("cursor"),
        previous: Vec::new(),
        num: 3,
        last: false,
    };
    let view = h
        .storage
        .fetch(
            &h.ctx,
            &conversation(&h.conv_id, 20),
            &h.uid,
            None,
            None,
            Some(&pagination),
        )
        .expect("fetch");
    assert_eq!(ids_of(&view.messages), vec![9, 8, 7]);

    let next: MessageId = codec::decode(&view.pagination.next).expect("next cursor");
    let previous: MessageId = codec::decode(&view.pagination.previous).expect("prev cursor");
    assert_eq!(next, MessageId::new(7));
    assert_eq!(previous, MessageId::new(9));
    assert!(!view.pagination.last);
}

#[test]
fn previous_cursor_pages_newer_messages() {
    let h = setup();
    let msgs: Vec<_> = (1..=20).rev().map(|id| text(id, "m")).collect();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &msgs)
        .expect("merge");

    let pagination = Pagination {
        next: Vec::new(),
        previous: codec::encode(&MessageId::new(10)).expect("cursor"),
        num: 3,
        last: false,
    };
    let view = h
        .storage
        .fetch(
            &h.ctx,
            &conversation(&h.conv_id, 20),
            &h.uid,
            None,
            None,
            Some(&pagination),
        )
        .expect("fetch");
    assert_eq!(ids_of(&view.messages), vec![13, 12, 11]);
}

#[test]
fn bad_cursor_is_a_remote_error() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(1, "a")])
        .expect("merge");

    let pagination = Pagination {
        next: vec![0xFF, 0x00, 0xFF],
        previous: Vec::new(),
        num: 3,
        last: false,
    };
    let res = h.storage.fetch(
        &h.ctx,
        &conversation(&h.conv_id, 1),
        &h.uid,
        None,
        None,
        Some(&pagination),
    );
    assert!(matches!(res, Err(StorageError::Remote { .. })));
}

#[test]
fn typed_query_counts_only_requested_types() {
    let h = setup();
    h.storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[
                headline(5, "e"),
                text(4, "d"),
                headline(3, "c"),
                text(2, "b"),
                text(1, "a"),
            ],
        )
        .expect("merge");

    let query = GetThreadQuery {
        message_types: vec![MessageType::Text],
    };
    let pagination = Pagination {
        num: 2,
        ..Pagination::default()
    };
    let view = h
        .storage
        .fetch(
            &h.ctx,
            &conversation(&h.conv_id, 5),
            &h.uid,
            None,
            Some(&query),
            Some(&pagination),
        )
        .expect("fetch");

    // Non-matching types still appear; the scan stops once two texts
    // have been seen.
    assert_eq!(ids_of(&view.messages), vec![5, 4, 3, 2]);
}

#[test]
fn holey_collector_tolerates_bounded_gaps() {
    let h = setup();
    h.storage
        .merge(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[text(10, "j"), text(8, "h"), text(7, "g")],
        )
        .expect("merge");

    let mut rc = HoleyResultCollector::new(1, SimpleResultCollector::new(3));
    let view = h
        .storage
        .fetch(
            &h.ctx,
            &conversation(&h.conv_id, 10),
            &h.uid,
            Some(&mut rc),
            None,
            None,
        )
        .expect("fetch");

    assert_eq!(ids_of(&view.messages), vec![10, 9, 8]);
    assert!(matches!(
        view.messages[1],
        MessageUnboxed::Placeholder(p) if p.message_id == MessageId::new(9)
    ));
    assert_eq!(rc.holes(), 1);
}

#[test]
fn gap_beyond_the_hole_budget_is_a_miss() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(10, "j"), text(7, "g")])
        .expect("merge");

    let mut rc = HoleyResultCollector::new(1, SimpleResultCollector::new(4));
    let res = h.storage.fetch(
        &h.ctx,
        &conversation(&h.conv_id, 10),
        &h.uid,
        Some(&mut rc),
        None,
        None,
    );
    match res {
        Err(StorageError::Miss { msg_id }) => assert_eq!(msg_id, MessageId::new(8)),
        other => panic!("expected a miss for id 8, got {other:?}"),
    }
}

#[test]
fn negative_target_swallows_the_miss_on_an_empty_store() {
    let h = setup();
    let mut rc = SimpleResultCollector::new(-1);
    let view = h
        .storage
        .fetch(
            &h.ctx,
            &conversation(&h.conv_id, 5),
            &h.uid,
            Some(&mut rc),
            None,
            None,
        )
        .expect("fetch");
    assert!(view.messages.is_empty());
    assert!(view.pagination.last);
}

#[test]
fn fetch_up_to_local_max_uses_the_tracker_seed() {
    let h = setup();
    let msgs: Vec<_> = (1..=5).rev().map(|id| text(id, "m")).collect();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &msgs)
        .expect("merge");

    // The seed comes from the id tracker, not from any server state.
    let view = h
        .storage
        .fetch_up_to_local_max_msg_id(&h.ctx, &h.conv_id, &h.uid, None, None, None)
        .expect("fetch up to local max");
    assert_eq!(ids_of(&view.messages), vec![5, 4, 3, 2, 1]);
    assert!(view.pagination.last);
}

#[test]
fn fetch_messages_reports_absent_ids_as_none() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(3, "c"), text(1, "a")])
        .expect("merge");

    let res = h
        .storage
        .fetch_messages(
            &h.ctx,
            &h.conv_id,
            &h.uid,
            &[MessageId::new(3), MessageId::new(2), MessageId::new(1)],
        )
        .expect("fetch_messages");
    assert_eq!(res.len(), 3);
    assert!(res[0].is_some());
    assert!(res[1].is_none());
    assert!(res[2].is_some());
}

// ---------------------------------------------------------------------------
// Corruption and cancellation
// ---------------------------------------------------------------------------

#[test]
fn corrupt_block_wipes_the_block_index() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(1, "a")])
        .expect("merge");

    // Flip a byte in the stored block.
    let block_key = DbKey::new(
        Namespace::ChatBlocks,
        format!("bl:{}:{}:0", h.uid, h.conv_id),
    );
    let mut raw = h
        .backend
        .get(&h.ctx, &block_key)
        .expect("get block")
        .expect("block present");
    let mid = raw.len() / 2;
    raw[mid] ^= 0xFF;
    h.backend.put(&h.ctx, &block_key, &raw).expect("put block");

    let res = h.storage.fetch_messages(&h.ctx, &h.conv_id, &h.uid, &[MessageId::new(1)]);
    assert!(matches!(res, Err(StorageError::Corrupt { .. })));

    // The index record for (conv, uid) must be gone.
    let index_key = DbKey::new(
        Namespace::ChatBlockIndex,
        format!("bi:{}:{}", h.uid, h.conv_id),
    );
    assert_eq!(h.backend.get(&h.ctx, &index_key).expect("get index"), None);
}

#[test]
fn wrong_key_reads_as_clearing_error() {
    let h = setup();
    h.storage
        .merge(&h.ctx, &h.conv_id, &h.uid, &[text(1, "a")])
        .expect("merge");

    // Same backend, different device key.
    let other = Storage::new(
        h.backend.clone(),
        Arc::new(StaticKeyProvider::new([0x43u8; 32])),
    );
    let res = other.fetch_messages(&h.ctx, &h.conv_id, &h.uid, &[MessageId::new(1)]);
    match res {
        Err(err) => assert!(err.should_clear(), "expected a clearing error, got {err}"),
        Ok(_) => panic!("expected the read to fail under a different key"),
    }
}

#[test]
fn canceled_context_aborts_the_operation() {
    let h = setup();
    let ctx = Context::background();
    ctx.cancel();
    let res = h.storage.merge(&ctx, &h.conv_id, &h.uid, &[text(1, "a")]);
    assert!(matches!(res, Err(StorageError::Canceled)));
}

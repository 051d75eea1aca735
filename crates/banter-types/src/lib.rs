//! Core shared types for the banter chat client.
//!
//! This crate defines the identifiers, message variants, and thread/query
//! types used across the workspace. No other crate should define shared
//! types — everything lives here.

pub mod message;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use message::{
    is_deletable_by_delete_history, supersedes_of, MessageAttachment, MessageAttachmentUploaded,
    MessageBody, MessageClientHeader, MessageDelete, MessageDeleteHistory, MessageEdit,
    MessageError, MessageHeadline, MessageMetadata, MessageOutbox, MessagePlaceholder,
    MessageReaction, MessageServerHeader, MessageText, MessageType, MessageUnboxed, MessageValid,
};

// ---------------------------------------------------------------------------
// ConversationId
// ---------------------------------------------------------------------------

/// Opaque server-assigned conversation identifier.
///
/// The client treats the bytes as a black box; they are only ever compared,
/// hex-encoded into storage keys, and echoed back to the server.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ConversationId(Vec<u8>);

impl ConversationId {
    /// Creates a `ConversationId` from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ConversationId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for ConversationId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Opaque identifier of the local user.
///
/// Local storage is namespaced by (conversation, user) so that switching
/// accounts on one device never mixes caches.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UserId(Vec<u8>);

impl UserId {
    /// Creates a `UserId` from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for UserId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for UserId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Server-assigned message identifier.
///
/// Ids are positive and monotonically increasing within a conversation.
/// Zero is the null id; it never refers to a real message and doubles as
/// the "not superseded" marker in [`MessageServerHeader`].
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct MessageId(u64);

impl MessageId {
    /// The null id.
    pub const NONE: MessageId = MessageId(0);

    /// Creates a `MessageId` from its numeric value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns `true` for the null id.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Opaque thread pagination state.
///
/// `next` and `previous` are serialized cursors produced by the pager; the
/// client hands them back verbatim to page older or newer messages. `num`
/// is the requested (incoming) or returned (outgoing) page size.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    /// Cursor for paging older messages. Empty when unset.
    pub next: Vec<u8>,
    /// Cursor for paging newer messages. Empty when unset.
    pub previous: Vec<u8>,
    /// Page size.
    pub num: usize,
    /// Set on an outgoing page that exhausted the stored thread.
    pub last: bool,
}

// ---------------------------------------------------------------------------
// GetThreadQuery
// ---------------------------------------------------------------------------

/// Filter options for a thread fetch.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GetThreadQuery {
    /// When non-empty, only messages of these types count toward the
    /// requested page size (all types are still returned).
    pub message_types: Vec<MessageType>,
}

// ---------------------------------------------------------------------------
// ThreadView
// ---------------------------------------------------------------------------

/// One page of a conversation, newest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThreadView {
    /// Messages in descending id order.
    pub messages: Vec<MessageUnboxed>,
    /// Pagination state for fetching the adjacent pages.
    pub pagination: Pagination,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Immutable conversation metadata.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    /// The conversation identifier.
    pub conversation_id: ConversationId,
}

/// Per-reader view state delivered by the server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationReaderInfo {
    /// The largest message id the server knows for this conversation.
    pub max_msgid: MessageId,
}

/// Server view of a conversation, as consumed by the local store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation metadata.
    pub metadata: ConversationMetadata,
    /// Reader info for the local user.
    pub reader_info: ConversationReaderInfo,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

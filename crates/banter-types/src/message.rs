//! The unboxed message sum type and its bodies.
//!
//! An unboxed message is the output of decrypting and verifying a
//! server-delivered message. It is a closed union: `Valid` for messages
//! that unboxed cleanly, `Error` for ones that did not, `Outbox` for
//! locally composed messages awaiting acknowledgement, and `Placeholder`
//! for ids the client knows about but has never seen. Only `Valid` and
//! `Error` are ever persisted; placeholders are synthesized by read
//! collectors and outbox records live in their own queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, UserId};

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Classification of a message, assigned at composition time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// No type; placeholders and malformed records report this.
    None,
    /// Plain text.
    Text,
    /// Attachment pointer.
    Attachment,
    /// Edit of an earlier message.
    Edit,
    /// Deletion of one or more earlier messages.
    Delete,
    /// Conversation metadata change.
    Metadata,
    /// Conversation headline change.
    Headline,
    /// Follow-up carrying the uploaded asset for an attachment.
    AttachmentUploaded,
    /// Member joined.
    Join,
    /// Member left.
    Leave,
    /// System-generated notice.
    System,
    /// Retroactive purge of all deletable messages below a horizon.
    DeleteHistory,
    /// Emoji reaction to an earlier message.
    Reaction,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Text => "text",
            Self::Attachment => "attachment",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Metadata => "metadata",
            Self::Headline => "headline",
            Self::AttachmentUploaded => "attachmentuploaded",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::System => "system",
            Self::DeleteHistory => "deletehistory",
            Self::Reaction => "reaction",
        };
        write!(f, "{s}")
    }
}

/// Whether a delete-history directive may blank messages of this type.
///
/// Content types are deletable; membership, metadata, and the deletion
/// directives themselves are not.
pub fn is_deletable_by_delete_history(typ: MessageType) -> bool {
    matches!(
        typ,
        MessageType::Text
            | MessageType::Attachment
            | MessageType::Edit
            | MessageType::AttachmentUploaded
            | MessageType::Reaction
    )
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// Body of a text message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageText {
    /// The message text.
    pub body: String,
}

/// Body of an attachment message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageAttachment {
    /// Display filename.
    pub filename: String,
    /// MIME type of the asset.
    pub mime_type: String,
    /// Opaque pointer to the uploaded asset.
    pub object: Vec<u8>,
}

/// Body of an edit; replaces the text of `message_id`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageEdit {
    /// Target of the edit.
    pub message_id: MessageId,
    /// Replacement text.
    pub body: String,
}

/// Body of a deletion; blanks every listed target.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageDelete {
    /// Targets of the deletion.
    pub message_ids: Vec<MessageId>,
}

/// Body of a headline change.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageHeadline {
    /// The new headline.
    pub headline: String,
}

/// Body of a conversation metadata change.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// The new conversation title.
    pub conversation_title: String,
}

/// Body of the follow-up sent once an attachment upload completes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageAttachmentUploaded {
    /// The attachment message this upload belongs to.
    pub message_id: MessageId,
    /// Opaque pointer to the uploaded asset.
    pub object: Vec<u8>,
}

/// Body of a delete-history directive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageDeleteHistory {
    /// Exclusive horizon: every deletable message with id strictly below
    /// this is purged.
    pub upto: MessageId,
}

/// Body of a reaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageReaction {
    /// The message being reacted to.
    pub message_id: MessageId,
    /// The reaction content (an emoji).
    pub body: String,
}

/// Tagged union of message bodies.
///
/// The tag mirrors [`MessageType`] for the types that carry content. A
/// message whose body has been blanked by a deletion stores no body at
/// all (`Option::None` on [`MessageValid::body`]), not an empty variant.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Text content.
    Text(MessageText),
    /// Attachment pointer.
    Attachment(MessageAttachment),
    /// Edit content.
    Edit(MessageEdit),
    /// Deletion targets.
    Delete(MessageDelete),
    /// Headline content.
    Headline(MessageHeadline),
    /// Metadata content.
    Metadata(MessageMetadata),
    /// Uploaded-attachment follow-up.
    AttachmentUploaded(MessageAttachmentUploaded),
    /// Join marker.
    Join,
    /// Leave marker.
    Leave,
    /// System notice text.
    System(String),
    /// Delete-history horizon.
    DeleteHistory(MessageDeleteHistory),
    /// Reaction content.
    Reaction(MessageReaction),
}

impl MessageBody {
    /// The [`MessageType`] this body belongs to.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text(_) => MessageType::Text,
            Self::Attachment(_) => MessageType::Attachment,
            Self::Edit(_) => MessageType::Edit,
            Self::Delete(_) => MessageType::Delete,
            Self::Headline(_) => MessageType::Headline,
            Self::Metadata(_) => MessageType::Metadata,
            Self::AttachmentUploaded(_) => MessageType::AttachmentUploaded,
            Self::Join => MessageType::Join,
            Self::Leave => MessageType::Leave,
            Self::System(_) => MessageType::System,
            Self::DeleteHistory(_) => MessageType::DeleteHistory,
            Self::Reaction(_) => MessageType::Reaction,
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Fields stamped by the server on delivery.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageServerHeader {
    /// The message id.
    pub message_id: MessageId,
    /// Id of the message that superseded this one (edit, delete,
    /// reaction, ...). [`MessageId::NONE`] when not superseded.
    pub superseded_by: MessageId,
    /// Server receipt time.
    pub ctime: DateTime<Utc>,
}

/// Fields set by the composing client.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageClientHeader {
    /// The sender.
    pub sender: UserId,
    /// Declared message type. The unbox layer verifies it agrees with the
    /// body tag; this store re-checks before trusting it.
    pub message_type: MessageType,
}

// ---------------------------------------------------------------------------
// Message variants
// ---------------------------------------------------------------------------

/// A message that unboxed cleanly.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageValid {
    /// Server-stamped header.
    pub server_header: MessageServerHeader,
    /// Client-composed header.
    pub client_header: MessageClientHeader,
    /// The body, or `None` once blanked by a deletion.
    pub body: Option<MessageBody>,
}

impl MessageValid {
    /// The message id.
    pub fn message_id(&self) -> MessageId {
        self.server_header.message_id
    }

    /// The declared message type.
    pub fn message_type(&self) -> MessageType {
        self.client_header.message_type
    }
}

/// A message that failed to unbox. The id is trusted; nothing else is.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageError {
    /// The message id.
    pub message_id: MessageId,
    /// Human-readable unboxing failure.
    pub err_msg: String,
}

/// A locally composed message not yet acknowledged by the server.
///
/// Outbox records are queued elsewhere; the conversation store never
/// persists them and treats one found on disk as corruption.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageOutbox {
    /// Provisional id, zero until the server assigns one.
    pub message_id: MessageId,
}

/// A gap marker for an id the client has not seen.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessagePlaceholder {
    /// The missing id.
    pub message_id: MessageId,
}

/// The unboxed message union.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageUnboxed {
    /// Unboxed cleanly.
    Valid(MessageValid),
    /// Failed to unbox.
    Error(MessageError),
    /// Locally composed, unacknowledged.
    Outbox(MessageOutbox),
    /// Known gap.
    Placeholder(MessagePlaceholder),
}

impl MessageUnboxed {
    /// The message id, whichever variant carries it.
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Valid(v) => v.message_id(),
            Self::Error(e) => e.message_id,
            Self::Outbox(o) => o.message_id,
            Self::Placeholder(p) => p.message_id,
        }
    }

    /// The message type; [`MessageType::None`] for variants without one.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Valid(v) => v.message_type(),
            _ => MessageType::None,
        }
    }

    /// Whether this is the `Valid` variant.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// The `Valid` payload, if that is the variant.
    pub fn valid(&self) -> Option<&MessageValid> {
        match self {
            Self::Valid(v) => Some(v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Supersedes
// ---------------------------------------------------------------------------

/// Ids whose rendering `msg` overrides.
///
/// This is the boundary with the unbox layer and must stay pure: the same
/// message always yields the same list, so repeated merges converge. A
/// message whose body is gone supersedes nothing.
pub fn supersedes_of(msg: &MessageValid) -> Vec<MessageId> {
    match &msg.body {
        Some(MessageBody::Edit(edit)) => vec![edit.message_id],
        Some(MessageBody::Delete(del)) => del.message_ids.clone(),
        Some(MessageBody::AttachmentUploaded(up)) => vec![up.message_id],
        Some(MessageBody::Reaction(re)) => vec![re.message_id],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

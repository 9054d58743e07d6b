use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const TEMPORARY_PREFIX: &str = "tmp-";

/// Account identity of a chat participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier. Server ids are opaque strings; ids minted locally for
/// optimistic sends carry the `tmp-` prefix and never collide with them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    #[default]
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Temporary id of the optimistic send this message confirms, when the
    /// server echoes it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<MessageId>,
    #[serde(default, skip_serializing)]
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Builds the optimistic local entry for an outgoing message.
    pub fn pending(
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        attachment_ref: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = MessageId::temporary();
        Self {
            client_ref: Some(id.clone()),
            id,
            sender_id,
            receiver_id,
            content,
            attachment_ref,
            created_at,
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    /// True when this message belongs to the one-to-one conversation between
    /// `a` and `b`, in either direction.
    pub fn involves(&self, a: &UserId, b: &UserId) -> bool {
        (&self.sender_id == a && &self.receiver_id == b)
            || (&self.sender_id == b && &self.receiver_id == a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub reactor_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentConversationSummary {
    pub peer_identity: UserId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub last_message_excerpt: String,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Plan state of the signed-in account. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntitlementFact {
    pub active: bool,
    #[serde(default, rename = "remaining_seconds")]
    pub remaining_secs: Option<u64>,
}

impl EntitlementFact {
    pub fn remaining_period(&self) -> Option<Duration> {
        self.remaining_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    pub client_ref: MessageId,
}

impl SendRequest {
    pub fn for_pending(message: &Message) -> Self {
        Self {
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            attachment_ref: message.attachment_ref.clone(),
            client_ref: message.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionRequest {
    pub message_id: MessageId,
    pub reactor_id: UserId,
    pub emoji: String,
}

/// File picked by the user, uploaded before the message that references it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedAttachment {
    pub url: String,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Content marker stored for favorite icebreakers
pub const HEART_CONTENT: &str = "system:heart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Text typed by a participant
    User,
    /// Reserved system/heart variant synthesized from a listing favorite
    System,
}

impl MessageKind {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db())
    }
}

/// User-visible delivery status; every message a presentation layer renders has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Position of a message in its conversation's total order.
///
/// Field order matters: the derived `Ord` compares `created_at` first and breaks
/// ties with the per-conversation `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub sequence: i64,
}

/// Authoritative message record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: String,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
}

impl Message {
    pub fn cursor(&self) -> MessageCursor {
        MessageCursor {
            created_at: self.created_at,
            sequence: self.sequence,
        }
    }

    /// Unread from `viewer`'s perspective: authored by the counterpart and never read
    pub fn is_unread_for(&self, viewer: Uuid) -> bool {
        self.sender_id != viewer && self.read_at.is_none()
    }

    pub fn is_system(&self) -> bool {
        self.kind == MessageKind::System
    }

    /// Server-side messages are always confirmed
    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::Sent
    }
}

/// Append payload; `sequence` and `created_at` are assigned by storage
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: String,
    pub correlation_token: Option<String>,
}

/// Result of a storage append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(Message),
    /// The sender already stored a message under the same correlation token
    Existing(Message),
}

impl AppendOutcome {
    pub fn is_existing(&self) -> bool {
        matches!(self, Self::Existing(_))
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Appended(message) | Self::Existing(message) => message,
        }
    }
}

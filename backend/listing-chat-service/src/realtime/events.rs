use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Events carried by a conversation subscription.
///
/// Only new activity is published; there is no backlog replay. Consumers
/// re-fetch from the message log after a gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    MessageAppended {
        message: Message,
    },
    MessagesRead {
        conversation_id: Uuid,
        reader_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: DateTime<Utc>,
    },
}

impl RealtimeEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::MessageAppended { message } => message.conversation_id,
            Self::MessagesRead {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Cross-instance relay record: the event plus the instance that published it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: Uuid,
    pub event: RealtimeEvent,
}

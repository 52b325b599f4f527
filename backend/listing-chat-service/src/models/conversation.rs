//! Conversation data structures
//!
//! A conversation pairs exactly two participants around one listing. The pair is
//! unordered: `ParticipantPair` stores it canonically (lower id first) so that the
//! uniqueness key `(listing_id, low, high)` is the same regardless of who
//! initiated contact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::message::Message;
use crate::error::{AppError, AppResult};

/// Canonically ordered pair of distinct participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantPair {
    low: Uuid,
    high: Uuid,
}

impl ParticipantPair {
    pub fn new(a: Uuid, b: Uuid) -> AppResult<Self> {
        if a == b {
            return Err(AppError::BadRequest(
                "a conversation needs two distinct participants".into(),
            ));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> Uuid {
        self.low
    }

    pub fn high(&self) -> Uuid {
        self.high
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The other member of the pair, if `user_id` belongs to it
    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.low {
            Some(self.high)
        } else if user_id == self.high {
            Some(self.low)
        } else {
            None
        }
    }

    pub fn members(&self) -> [Uuid; 2] {
        [self.low, self.high]
    }
}

/// One-way activation state: flips to `Active` the first time the listing
/// owner appends a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationState {
    #[default]
    Inactive,
    Active,
}

impl ActivationState {
    pub fn from_flag(activated: bool) -> Self {
        if activated {
            Self::Active
        } else {
            Self::Inactive
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Per-participant membership row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: Uuid,
    pub hidden_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    pub fn is_hidden(&self) -> bool {
        self.hidden_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub listing_owner_id: Uuid,
    pub participants: BTreeMap<Uuid, Membership>,
    pub activation: ActivationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains_key(&user_id)
    }

    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        if !self.is_participant(user_id) {
            return None;
        }
        self.participants.keys().copied().find(|id| *id != user_id)
    }

    pub fn is_hidden_for(&self, user_id: Uuid) -> bool {
        self.participants
            .get(&user_id)
            .map(Membership::is_hidden)
            .unwrap_or(false)
    }

    pub fn is_activated(&self) -> bool {
        self.activation.is_active()
    }

    pub fn is_listing_owner(&self, user_id: Uuid) -> bool {
        self.listing_owner_id == user_id
    }

    /// Resolve the counterpart or fail with an authorization error
    pub fn require_counterpart(&self, user_id: Uuid) -> AppResult<Uuid> {
        self.counterpart(user_id).ok_or(AppError::Forbidden)
    }
}

/// Insert payload for a conversation that does not exist yet
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub listing_owner_id: Uuid,
    pub pair: ParticipantPair,
}

impl NewConversation {
    pub fn new(listing_id: Uuid, listing_owner_id: Uuid, pair: ParticipantPair) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            listing_owner_id,
            pair,
        }
    }
}

/// Result of an insert attempted under the uniqueness constraint
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Conversation),
    /// Another writer created the same (listing, pair) first
    Conflict,
}

/// Inbox row as seen by one viewer
#[derive(Debug, Clone, Serialize)]
pub struct InboxEntry {
    pub conversation_id: Uuid,
    pub listing_id: Uuid,
    pub counterpart_id: Uuid,
    pub activation: ActivationState,
    pub blocked: bool,
    pub unread_count: i64,
    pub last_message: Option<Message>,
    pub updated_at: DateTime<Utc>,
}

//! Optimistic timeline for one conversation.
//!
//! Provisional entries are keyed by a caller-generated correlation token and
//! replaced in place when the authoritative message carrying the same token
//! arrives, either as the send response or through the realtime feed. There
//! is never more than one entry per logical message.
//!
//! Sequences are gapless within a conversation, so the timeline tracks the
//! longest run of sequences it holds from the start. Backfill resumes after
//! that run, which fetches anything the feed missed even when a later send
//! response was already confirmed.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::models::{DeliveryStatus, Message, MessageCursor, MessageKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub correlation_token: Option<String>,
    /// Set once the server has confirmed the message
    pub message_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: String,
    pub status: DeliveryStatus,
    /// Local clock while pending, server clock once sent
    pub created_at: DateTime<Utc>,
    pub sequence: Option<i64>,
    pub read_at: Option<DateTime<Utc>>,
}

impl TimelineEntry {
    pub fn is_provisional(&self) -> bool {
        self.message_id.is_none()
    }

    pub fn cursor(&self) -> Option<MessageCursor> {
        self.sequence.map(|sequence| MessageCursor {
            created_at: self.created_at,
            sequence,
        })
    }

    fn from_message(message: Message) -> Self {
        Self {
            correlation_token: message.correlation_token,
            message_id: Some(message.id),
            sender_id: message.sender_id,
            kind: message.kind,
            content: message.content,
            status: DeliveryStatus::Sent,
            created_at: message.created_at,
            sequence: Some(message.sequence),
            read_at: message.read_at,
        }
    }

    fn confirm_with(&mut self, message: Message) {
        self.message_id = Some(message.id);
        self.content = message.content;
        self.kind = message.kind;
        self.created_at = message.created_at;
        self.sequence = Some(message.sequence);
        self.read_at = message.read_at;
        self.status = DeliveryStatus::Sent;
    }
}

/// A send the caller has to perform (first attempt or retry)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub correlation_token: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A provisional entry was confirmed in place
    Confirmed,
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    seen_ids: HashSet<Uuid>,
    /// Every sequence up to this position is in `entries`
    sync_cursor: Option<MessageCursor>,
    /// Confirmed positions past `sync_cursor`, waiting for the gap to close
    ahead: BTreeMap<i64, MessageCursor>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, correlation_token: &str) -> Option<&TimelineEntry> {
        self.entries
            .iter()
            .find(|e| e.correlation_token.as_deref() == Some(correlation_token))
    }

    fn position_of_token(&self, correlation_token: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.correlation_token.as_deref() == Some(correlation_token))
    }

    /// Append a pending entry for a send the user just made. It shows up
    /// immediately; the caller performs the network send with the returned
    /// token.
    pub fn begin_send(&mut self, sender_id: Uuid, content: &str, now: DateTime<Utc>) -> PendingSend {
        let correlation_token = Uuid::new_v4().to_string();
        self.entries.push(TimelineEntry {
            correlation_token: Some(correlation_token.clone()),
            message_id: None,
            sender_id,
            kind: MessageKind::User,
            content: content.to_string(),
            status: DeliveryStatus::Pending,
            created_at: now,
            sequence: None,
            read_at: None,
        });
        PendingSend {
            correlation_token,
            content: content.to_string(),
        }
    }

    /// Merge an authoritative message from any path
    pub fn ingest(&mut self, message: Message) -> IngestOutcome {
        if self.seen_ids.contains(&message.id) {
            return IngestOutcome::Duplicate;
        }

        if let Some(token) = message.correlation_token.as_deref() {
            if let Some(index) = self.position_of_token(token) {
                if !self.entries[index].is_provisional() {
                    // Same logical message persisted twice (retry after a lost response)
                    debug!(token, "ignoring second confirmation for correlation token");
                    return IngestOutcome::Duplicate;
                }
                self.seen_ids.insert(message.id);
                self.record_position(message.cursor());
                self.entries[index].confirm_with(message);
                self.reposition(index);
                return IngestOutcome::Confirmed;
            }
        }

        self.seen_ids.insert(message.id);
        self.record_position(message.cursor());
        let index = self.insert_index(message.cursor());
        self.entries.insert(index, TimelineEntry::from_message(message));
        IngestOutcome::Inserted
    }

    /// Provisional entries keep their slot; only confirmed ones are ordered against
    fn insert_index(&self, cursor: MessageCursor) -> usize {
        self.entries
            .iter()
            .position(|e| e.cursor().is_some_and(|c| c > cursor))
            .unwrap_or(self.entries.len())
    }

    /// Move a just-confirmed entry to its server position when remote
    /// messages inserted while it was pending ended up on the wrong side of it
    fn reposition(&mut self, index: usize) {
        let Some(cursor) = self.entries[index].cursor() else {
            return;
        };
        let before_is_later = self.entries[..index]
            .iter()
            .any(|e| e.cursor().is_some_and(|c| c > cursor));
        let after_is_earlier = self.entries[index + 1..]
            .iter()
            .any(|e| e.cursor().is_some_and(|c| c < cursor));
        if before_is_later || after_is_earlier {
            let entry = self.entries.remove(index);
            let target = self.insert_index(cursor);
            self.entries.insert(target, entry);
        }
    }

    fn record_position(&mut self, cursor: MessageCursor) {
        let next = self.sync_cursor.map_or(1, |c| c.sequence + 1);
        if cursor.sequence < next {
            return;
        }
        self.ahead.insert(cursor.sequence, cursor);
        let mut next = next;
        while let Some(cursor) = self.ahead.remove(&next) {
            self.sync_cursor = Some(cursor);
            next += 1;
        }
    }

    /// Mark a pending send as failed; returns false if it was not pending
    pub fn fail(&mut self, correlation_token: &str) -> bool {
        match self.position_of_token(correlation_token) {
            Some(index) if self.entries[index].status == DeliveryStatus::Pending => {
                self.entries[index].status = DeliveryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Re-arm a failed entry as pending with the same token
    pub fn retry(&mut self, correlation_token: &str) -> Option<PendingSend> {
        let index = self.position_of_token(correlation_token)?;
        let entry = &mut self.entries[index];
        if entry.status != DeliveryStatus::Failed {
            return None;
        }
        entry.status = DeliveryStatus::Pending;
        Some(PendingSend {
            correlation_token: correlation_token.to_string(),
            content: entry.content.clone(),
        })
    }

    pub fn apply_read(&mut self, message_ids: &[Uuid], read_at: DateTime<Utc>) {
        for entry in &mut self.entries {
            if let Some(id) = entry.message_id {
                if entry.read_at.is_none() && message_ids.contains(&id) {
                    entry.read_at = Some(read_at);
                }
            }
        }
    }

    /// End of the gap-free run of confirmed messages; the backfill starts
    /// strictly after it
    pub fn sync_cursor(&self) -> Option<MessageCursor> {
        self.sync_cursor
    }
}

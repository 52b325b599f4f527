//! In-memory repositories used by tests and by the service when no
//! `DATABASE_URL` is configured. They honor the same invariants as the
//! PostgreSQL schema: unique `(listing, pair)`, monotonic per-conversation
//! sequence and timestamps, and write-once `read_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BlockRepository, ConversationRepository, ListingDirectory, MessageRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    ActivationState, AppendOutcome, BlockRelation, Conversation, InsertOutcome, Membership,
    Message, MessageCursor, NewConversation, NewMessage, ParticipantPair,
};

#[derive(Default)]
struct ConversationTables {
    by_id: HashMap<Uuid, Conversation>,
    by_key: HashMap<(Uuid, ParticipantPair), Uuid>,
}

#[derive(Default)]
pub struct InMemoryConversations {
    inner: RwLock<ConversationTables>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversations {
    async fn find_by_key(
        &self,
        listing_id: Uuid,
        pair: ParticipantPair,
    ) -> AppResult<Option<Conversation>> {
        let guard = self.inner.read().await;
        Ok(guard
            .by_key
            .get(&(listing_id, pair))
            .and_then(|id| guard.by_id.get(id))
            .cloned())
    }

    async fn insert(&self, new: &NewConversation) -> AppResult<InsertOutcome> {
        let mut guard = self.inner.write().await;
        let key = (new.listing_id, new.pair);
        if guard.by_key.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }

        let now = Utc::now();
        let participants: BTreeMap<Uuid, Membership> = new
            .pair
            .members()
            .into_iter()
            .map(|user_id| {
                (
                    user_id,
                    Membership {
                        user_id,
                        hidden_at: None,
                        joined_at: now,
                    },
                )
            })
            .collect();

        let conversation = Conversation {
            id: new.id,
            listing_id: new.listing_id,
            listing_owner_id: new.listing_owner_id,
            participants,
            activation: ActivationState::Inactive,
            created_at: now,
            updated_at: now,
        };
        guard.by_key.insert(key, new.id);
        guard.by_id.insert(new.id, conversation.clone());
        Ok(InsertOutcome::Inserted(conversation))
    }

    async fn get(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.inner.read().await.by_id.get(&conversation_id).cloned())
    }

    async fn set_hidden(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        hidden: bool,
    ) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        let membership = guard
            .by_id
            .get_mut(&conversation_id)
            .and_then(|c| c.participants.get_mut(&user_id))
            .ok_or(AppError::NotFound("conversation participant"))?;

        if membership.is_hidden() == hidden {
            return Ok(false);
        }
        membership.hidden_at = hidden.then(Utc::now);
        Ok(true)
    }

    async fn touch(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        let mut guard = self.inner.write().await;
        if let Some(conversation) = guard.by_id.get_mut(&conversation_id) {
            conversation.updated_at = conversation.updated_at.max(at);
        }
        Ok(())
    }

    async fn activate(&self, conversation_id: Uuid) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        let conversation = guard
            .by_id
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound("conversation"))?;
        if conversation.is_activated() {
            return Ok(false);
        }
        conversation.activation = ActivationState::Active;
        Ok(true)
    }

    async fn list_visible_for(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Conversation>> {
        let guard = self.inner.read().await;
        let mut visible: Vec<Conversation> = guard
            .by_id
            .values()
            .filter(|c| c.is_participant(user_id) && !c.is_hidden_for(user_id))
            .cloned()
            .collect();
        visible.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        visible.truncate(limit.max(0) as usize);
        Ok(visible)
    }

    async fn visible_ids_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let guard = self.inner.read().await;
        Ok(guard
            .by_id
            .values()
            .filter(|c| c.is_participant(user_id) && !c.is_hidden_for(user_id))
            .map(|c| c.id)
            .collect())
    }
}

#[derive(Default)]
struct ConversationLog {
    messages: Vec<Message>,
    last_seq: i64,
    last_created_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MessageTables {
    logs: HashMap<Uuid, ConversationLog>,
    // message id -> (conversation id, position in log)
    index: HashMap<Uuid, (Uuid, usize)>,
}

#[derive(Default)]
pub struct InMemoryMessages {
    inner: RwLock<MessageTables>,
}

impl InMemoryMessages {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessages {
    async fn append(&self, new: NewMessage) -> AppResult<AppendOutcome> {
        let mut guard = self.inner.write().await;
        let log = guard.logs.entry(new.conversation_id).or_default();

        if let Some(token) = new.correlation_token.as_deref() {
            let existing = log.messages.iter().find(|m| {
                m.sender_id == new.sender_id && m.correlation_token.as_deref() == Some(token)
            });
            if let Some(existing) = existing {
                return Ok(AppendOutcome::Existing(existing.clone()));
            }
        }

        log.last_seq += 1;
        let now = Utc::now();
        let created_at = log.last_created_at.map_or(now, |last| last.max(now));
        log.last_created_at = Some(created_at);

        let message = Message {
            id: new.id,
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            kind: new.kind,
            content: new.content,
            sequence: log.last_seq,
            created_at,
            read_at: None,
            correlation_token: new.correlation_token,
        };
        let position = log.messages.len();
        log.messages.push(message.clone());
        guard
            .index
            .insert(message.id, (message.conversation_id, position));
        Ok(AppendOutcome::Appended(message))
    }

    async fn list(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let guard = self.inner.read().await;
        let Some(log) = guard.logs.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        // Appends are already in (created_at, sequence) order.
        Ok(log
            .messages
            .iter()
            .filter(|m| after.map_or(true, |cursor| m.cursor() > cursor))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        let guard = self.inner.read().await;
        Ok(guard
            .logs
            .get(&conversation_id)
            .and_then(|log| log.messages.last())
            .cloned())
    }

    async fn unread_ids(&self, conversation_id: Uuid, reader_id: Uuid) -> AppResult<Vec<Uuid>> {
        let guard = self.inner.read().await;
        Ok(guard
            .logs
            .get(&conversation_id)
            .map(|log| {
                log.messages
                    .iter()
                    .filter(|m| m.is_unread_for(reader_id))
                    .map(|m| m.id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_read(&self, message_ids: &[Uuid], at: DateTime<Utc>) -> AppResult<u64> {
        let mut guard = self.inner.write().await;
        let MessageTables { logs, index } = &mut *guard;
        let mut changed = 0;
        for id in message_ids {
            let Some((conversation_id, position)) = index.get(id) else {
                continue;
            };
            if let Some(message) = logs
                .get_mut(conversation_id)
                .and_then(|log| log.messages.get_mut(*position))
            {
                if message.read_at.is_none() {
                    message.read_at = Some(at);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn count_unread(&self, reader_id: Uuid, conversation_ids: &[Uuid]) -> AppResult<i64> {
        let guard = self.inner.read().await;
        Ok(conversation_ids
            .iter()
            .filter_map(|id| guard.logs.get(id))
            .flat_map(|log| log.messages.iter())
            .filter(|m| m.is_unread_for(reader_id))
            .count() as i64)
    }
}

#[derive(Default)]
pub struct InMemoryBlocks {
    inner: RwLock<HashMap<(Uuid, Uuid), DateTime<Utc>>>,
}

impl InMemoryBlocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockRepository for InMemoryBlocks {
    async fn insert(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&(blocker_id, blocked_id)) {
            return Ok(false);
        }
        guard.insert((blocker_id, blocked_id), Utc::now());
        Ok(true)
    }

    async fn delete(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool> {
        Ok(self
            .inner
            .write()
            .await
            .remove(&(blocker_id, blocked_id))
            .is_some())
    }

    async fn exists(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool> {
        Ok(self
            .inner
            .read()
            .await
            .contains_key(&(blocker_id, blocked_id)))
    }

    async fn list_blocked_by(&self, blocker_id: Uuid) -> AppResult<Vec<BlockRelation>> {
        let guard = self.inner.read().await;
        let mut relations: Vec<BlockRelation> = guard
            .iter()
            .filter(|((blocker, _), _)| *blocker == blocker_id)
            .map(|((blocker, blocked), created_at)| BlockRelation {
                blocker_id: *blocker,
                blocked_id: *blocked,
                created_at: *created_at,
            })
            .collect();
        relations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(relations)
    }
}

/// Listing → owner projection fed by the listing collaborator
#[derive(Default)]
pub struct InMemoryListings {
    owners: RwLock<HashMap<Uuid, Uuid>>,
}

impl InMemoryListings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, listing_id: Uuid, owner_id: Uuid) {
        self.owners.write().await.insert(listing_id, owner_id);
    }
}

#[async_trait]
impl ListingDirectory for InMemoryListings {
    async fn listing_owner(&self, listing_id: Uuid) -> AppResult<Option<Uuid>> {
        Ok(self.owners.read().await.get(&listing_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    fn new_message(conversation_id: Uuid, sender_id: Uuid, content: &str) -> NewMessage {
        NewMessage {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            kind: MessageKind::User,
            content: content.to_string(),
            correlation_token: None,
        }
    }

    async fn append(repo: &InMemoryMessages, new: NewMessage) -> Message {
        repo.append(new).await.unwrap().into_message()
    }

    #[tokio::test]
    async fn test_insert_conflicts_on_same_listing_and_pair() {
        let repo = InMemoryConversations::new();
        let (listing, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let first = NewConversation::new(listing, b, ParticipantPair::new(a, b).unwrap());
        let second = NewConversation::new(listing, b, ParticipantPair::new(b, a).unwrap());

        assert!(matches!(
            repo.insert(&first).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert!(matches!(
            repo.insert(&second).await.unwrap(),
            InsertOutcome::Conflict
        ));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_sequence() {
        let repo = InMemoryMessages::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();

        let first = append(&repo, new_message(conversation, sender, "a")).await;
        let second = append(&repo, new_message(conversation, sender, "b")).await;

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(second.created_at >= first.created_at);
        assert!(second.cursor() > first.cursor());
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_unread_rows() {
        let repo = InMemoryMessages::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let m = append(&repo, new_message(conversation, sender, "hi")).await;

        let first_read = Utc::now();
        assert_eq!(repo.mark_read(&[m.id], first_read).await.unwrap(), 1);
        assert_eq!(repo.mark_read(&[m.id], Utc::now()).await.unwrap(), 0);

        let stored = repo.list(conversation, None, 10).await.unwrap();
        assert_eq!(stored[0].read_at, Some(first_read));
    }

    #[tokio::test]
    async fn test_list_after_cursor_excludes_cursor_row() {
        let repo = InMemoryMessages::new();
        let conversation = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let first = append(&repo, new_message(conversation, sender, "1")).await;
        append(&repo, new_message(conversation, sender, "2")).await;

        let after = repo
            .list(conversation, Some(first.cursor()), 10)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "2");
    }

    #[tokio::test]
    async fn test_append_reuses_row_for_repeated_token() {
        let repo = InMemoryMessages::new();
        let conversation = Uuid::new_v4();
        let (sender, other) = (Uuid::new_v4(), Uuid::new_v4());
        let with_token = |sender_id, content: &str| NewMessage {
            correlation_token: Some("tok-1".into()),
            ..new_message(conversation, sender_id, content)
        };

        let first = repo.append(with_token(sender, "hi")).await.unwrap();
        let again = repo.append(with_token(sender, "hi")).await.unwrap();
        assert!(!first.is_existing());
        assert!(again.is_existing());
        assert_eq!(again.into_message(), first.into_message());

        // Tokens are scoped to the sender
        let theirs = repo.append(with_token(other, "hi")).await.unwrap();
        assert!(!theirs.is_existing());
        assert_eq!(repo.list(conversation, None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_block_insert_is_idempotent() {
        let repo = InMemoryBlocks::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(repo.insert(a, b).await.unwrap());
        assert!(!repo.insert(a, b).await.unwrap());

        let status = repo.status_between(b, a).await.unwrap();
        assert!(status.is_blocked_by);
        assert!(!status.is_blocking);
    }
}

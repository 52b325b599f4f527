//! Storage ports for the messaging engine.
//!
//! Every trait has a PostgreSQL implementation (`postgres`) and an in-memory
//! implementation (`memory`). Services only ever see the traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    AppendOutcome, BlockRelation, BlockStatus, Conversation, InsertOutcome, Message,
    MessageCursor, NewConversation, NewMessage, ParticipantPair,
};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryBlocks, InMemoryConversations, InMemoryListings, InMemoryMessages};
pub use postgres::PgChatRepository;

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Look up the conversation for a listing and an unordered participant pair
    async fn find_by_key(
        &self,
        listing_id: Uuid,
        pair: ParticipantPair,
    ) -> AppResult<Option<Conversation>>;

    /// Insert under the `(listing, pair)` uniqueness constraint.
    /// Losing a race is reported as `InsertOutcome::Conflict`, not as an error.
    async fn insert(&self, new: &NewConversation) -> AppResult<InsertOutcome>;

    async fn get(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>>;

    /// Set or clear one participant's hidden flag.
    /// Returns whether the stored flag changed.
    async fn set_hidden(&self, conversation_id: Uuid, user_id: Uuid, hidden: bool)
        -> AppResult<bool>;

    /// Bump `updated_at` (never moves it backwards)
    async fn touch(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    /// Flip `activated` to true. Returns true only for the call that performed the transition.
    async fn activate(&self, conversation_id: Uuid) -> AppResult<bool>;

    /// Conversations not hidden by `user_id`, most recently active first
    async fn list_visible_for(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Conversation>>;

    /// Ids of every conversation not hidden by `user_id`
    async fn visible_ids_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;

    async fn health_check(&self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Append with a storage-assigned sequence and a `created_at` that never
    /// decreases within the conversation.
    ///
    /// A correlation token the sender already used in this conversation
    /// yields the stored row as `AppendOutcome::Existing`; nothing is written.
    async fn append(&self, new: NewMessage) -> AppResult<AppendOutcome>;

    /// Messages strictly after `after`, ordered by `(created_at, sequence)`
    async fn list(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>>;

    /// Ids of messages in the conversation authored by someone other than
    /// `reader_id` and not read yet
    async fn unread_ids(&self, conversation_id: Uuid, reader_id: Uuid) -> AppResult<Vec<Uuid>>;

    /// Set `read_at` on exactly the given rows that are still unread.
    /// Returns the number of rows that changed.
    async fn mark_read(&self, message_ids: &[Uuid], at: DateTime<Utc>) -> AppResult<u64>;

    /// Unread messages for `reader_id` across the given conversations
    async fn count_unread(&self, reader_id: Uuid, conversation_ids: &[Uuid]) -> AppResult<i64>;
}

#[async_trait]
pub trait BlockRepository: Send + Sync {
    /// Returns true if the relation was newly created
    async fn insert(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool>;

    /// Returns true if a relation was removed
    async fn delete(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool>;

    /// Check if blocker has blocked blocked
    async fn exists(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool>;

    /// Both directions between `viewer` and `target`, from the viewer's side
    async fn status_between(&self, viewer: Uuid, target: Uuid) -> AppResult<BlockStatus> {
        let is_blocking = self.exists(viewer, target).await?;
        let is_blocked_by = self.exists(target, viewer).await?;
        Ok(BlockStatus {
            is_blocking,
            is_blocked_by,
        })
    }

    async fn list_blocked_by(&self, blocker_id: Uuid) -> AppResult<Vec<BlockRelation>>;
}

/// Listing collaborator port: resolves a listing's owner
#[async_trait]
pub trait ListingDirectory: Send + Sync {
    async fn listing_owner(&self, listing_id: Uuid) -> AppResult<Option<Uuid>>;
}

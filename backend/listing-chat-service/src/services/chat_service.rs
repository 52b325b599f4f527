//! Messaging engine entry point used by the HTTP routes and the in-process
//! client transport.

use deadpool_postgres::Pool;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::block_registry::BlockRegistry;
use super::conversation_store::ConversationStore;
use super::message_log::{Appended, MessageLog, ReadReceipt};
use super::notification_dispatcher::{NotificationDispatcher, NotificationSink};
use crate::config::EngineLimits;
use crate::error::{AppError, AppResult};
use crate::models::{
    BlockRelation, BlockStatus, Conversation, InboxEntry, Message, MessageCursor, MessageKind, HEART_CONTENT,
};
use crate::realtime::{RealtimeEvent, RealtimeSyncChannel, Subscription};
use crate::repository::{
    BlockRepository, ConversationRepository, InMemoryBlocks, InMemoryConversations,
    InMemoryListings, InMemoryMessages, ListingDirectory, MessageRepository, PgChatRepository,
};

const INBOX_LIMIT: i64 = 200;

/// Storage backends the engine is assembled from
#[derive(Clone)]
pub struct Repositories {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub blocks: Arc<dyn BlockRepository>,
    pub listings: Arc<dyn ListingDirectory>,
}

impl Repositories {
    pub fn postgres(pool: Pool) -> Self {
        let repo = Arc::new(PgChatRepository::new(pool));
        Self {
            conversations: repo.clone(),
            messages: repo.clone(),
            blocks: repo.clone(),
            listings: repo,
        }
    }

    /// In-memory storage; the listing directory handle is returned so that
    /// callers can register listings.
    pub fn in_memory() -> (Self, Arc<InMemoryListings>) {
        let listings = Arc::new(InMemoryListings::new());
        let repos = Self {
            conversations: Arc::new(InMemoryConversations::new()),
            messages: Arc::new(InMemoryMessages::new()),
            blocks: Arc::new(InMemoryBlocks::new()),
            listings: listings.clone(),
        };
        (repos, listings)
    }
}

/// Conversation metadata as seen by one participant
#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub counterpart_id: Uuid,
    pub blocked: bool,
    pub block_status: BlockStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct FavoriteOutcome {
    pub conversation_id: Uuid,
    /// `None` when a block relation suppressed the icebreaker
    pub icebreaker: Option<Message>,
}

#[derive(Clone)]
pub struct ChatService {
    conversations: ConversationStore,
    blocks: BlockRegistry,
    log: MessageLog,
    realtime: RealtimeSyncChannel,
    notifications: NotificationDispatcher,
    limits: EngineLimits,
}

impl ChatService {
    pub fn new(
        repos: Repositories,
        realtime: RealtimeSyncChannel,
        sink: Arc<dyn NotificationSink>,
        limits: EngineLimits,
    ) -> Self {
        let conversations = ConversationStore::new(repos.conversations, repos.listings);
        let blocks = BlockRegistry::new(repos.blocks);
        let log = MessageLog::new(
            repos.messages,
            conversations.clone(),
            blocks.clone(),
            limits,
        );
        let notifications = NotificationDispatcher::new(sink, conversations.clone(), log.clone());
        Self {
            conversations,
            blocks,
            log,
            realtime,
            notifications,
            limits,
        }
    }

    pub fn limits(&self) -> EngineLimits {
        self.limits
    }

    pub fn realtime(&self) -> &RealtimeSyncChannel {
        &self.realtime
    }

    /// Get or create the conversation between the viewer and the listing owner
    pub async fn start_conversation(
        &self,
        viewer: Uuid,
        listing_id: Uuid,
    ) -> AppResult<ConversationDetail> {
        let conversation = self.conversations.open_with_owner(viewer, listing_id).await?;
        self.detail_for(viewer, conversation).await
    }

    pub async fn send_message(
        &self,
        viewer: Uuid,
        conversation_id: Uuid,
        content: &str,
        correlation_token: Option<String>,
    ) -> AppResult<Message> {
        let appended = self
            .log
            .append(
                conversation_id,
                viewer,
                content,
                MessageKind::User,
                correlation_token,
            )
            .await?;
        // A resend was already published and notified the first time
        if !appended.replayed {
            self.after_append(&appended).await;
        }
        Ok(appended.message)
    }

    /// Favorite a listing: drop a heart icebreaker into the conversation with
    /// its owner. A block relation suppresses the icebreaker without failing.
    pub async fn favorite_listing(&self, viewer: Uuid, listing_id: Uuid) -> AppResult<FavoriteOutcome> {
        let conversation = self.conversations.open_with_owner(viewer, listing_id).await?;

        let appended = match self
            .log
            .append(conversation.id, viewer, HEART_CONTENT, MessageKind::System, None)
            .await
        {
            Ok(appended) => appended,
            Err(AppError::Blocked) => {
                info!(
                    conversation_id = %conversation.id,
                    listing_id = %listing_id,
                    "favorite icebreaker suppressed by block relation"
                );
                return Ok(FavoriteOutcome {
                    conversation_id: conversation.id,
                    icebreaker: None,
                });
            }
            Err(e) => return Err(e),
        };

        self.after_append(&appended).await;
        Ok(FavoriteOutcome {
            conversation_id: conversation.id,
            icebreaker: Some(appended.message),
        })
    }

    async fn after_append(&self, appended: &Appended) {
        self.realtime
            .publish(RealtimeEvent::MessageAppended {
                message: appended.message.clone(),
            })
            .await;
        self.notifications.message_appended(appended).await;
    }

    pub async fn list_messages(
        &self,
        viewer: Uuid,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Message>> {
        self.log.list(conversation_id, viewer, after, limit).await
    }

    pub async fn mark_read(&self, viewer: Uuid, conversation_id: Uuid) -> AppResult<ReadReceipt> {
        let receipt = self.log.mark_read(conversation_id, viewer).await?;
        if receipt.marked > 0 {
            self.realtime
                .publish(RealtimeEvent::MessagesRead {
                    conversation_id,
                    reader_id: viewer,
                    message_ids: receipt.message_ids.clone(),
                    read_at: receipt.read_at,
                })
                .await;
        }
        Ok(receipt)
    }

    /// Non-hidden conversations, most recently active first
    pub async fn inbox(&self, viewer: Uuid) -> AppResult<Vec<InboxEntry>> {
        let conversations = self.conversations.visible_for(viewer, INBOX_LIMIT).await?;
        let mut entries = Vec::with_capacity(conversations.len());

        for conversation in conversations {
            let counterpart_id = conversation.require_counterpart(viewer)?;
            let blocked = self.blocks.is_blocked(viewer, counterpart_id).await?;
            let last_message = self.log.last_message(conversation.id).await?;
            let unread_count = self.log.count_unread(viewer, &[conversation.id]).await?;
            entries.push(InboxEntry {
                conversation_id: conversation.id,
                listing_id: conversation.listing_id,
                counterpart_id,
                activation: conversation.activation,
                blocked,
                unread_count,
                last_message,
                updated_at: conversation.updated_at,
            });
        }
        Ok(entries)
    }

    pub async fn conversation_detail(
        &self,
        viewer: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<ConversationDetail> {
        let conversation = self
            .conversations
            .get_for_participant(conversation_id, viewer)
            .await?;
        self.detail_for(viewer, conversation).await
    }

    async fn detail_for(
        &self,
        viewer: Uuid,
        conversation: Conversation,
    ) -> AppResult<ConversationDetail> {
        let counterpart_id = conversation.require_counterpart(viewer)?;
        let block_status = self.blocks.status(viewer, counterpart_id).await?;
        Ok(ConversationDetail {
            conversation,
            counterpart_id,
            blocked: block_status.is_blocked(),
            block_status,
        })
    }

    pub async fn hide_conversation(&self, viewer: Uuid, conversation_id: Uuid) -> AppResult<()> {
        self.conversations
            .hide_for_participant(conversation_id, viewer)
            .await
    }

    pub async fn block_user(&self, viewer: Uuid, target: Uuid) -> AppResult<()> {
        self.blocks.block(viewer, target).await
    }

    pub async fn unblock_user(&self, viewer: Uuid, target: Uuid) -> AppResult<()> {
        self.blocks.unblock(viewer, target).await
    }

    pub async fn block_status(&self, viewer: Uuid, target: Uuid) -> AppResult<BlockStatus> {
        self.blocks.status(viewer, target).await
    }

    /// Users the viewer has blocked, most recent first
    pub async fn blocked_users(&self, viewer: Uuid) -> AppResult<Vec<BlockRelation>> {
        self.blocks.blocked_by(viewer).await
    }

    pub async fn unread_count(&self, viewer: Uuid) -> AppResult<i64> {
        self.notifications.unread_count(viewer).await
    }

    /// Live events for a conversation the viewer takes part in
    pub async fn subscribe(&self, viewer: Uuid, conversation_id: Uuid) -> AppResult<Subscription> {
        self.conversations
            .get_for_participant(conversation_id, viewer)
            .await?;
        Ok(self.realtime.subscribe(conversation_id))
    }

    pub async fn health_check(&self) -> AppResult<()> {
        self.conversations.health_check().await
    }
}

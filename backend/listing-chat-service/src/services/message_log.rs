use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::block_registry::BlockRegistry;
use super::conversation_store::ConversationStore;
use crate::config::{EngineLimits, MAX_PAGE_LIMIT};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    ActivationState, AppendOutcome, Conversation, Message, MessageCursor, MessageKind, NewMessage,
};
use crate::repository::MessageRepository;

pub const MAX_CORRELATION_TOKEN_LEN: usize = 128;

/// Result of a successful append
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    pub conversation: Conversation,
    pub recipient_id: Uuid,
    /// This append flipped the conversation to active
    pub activated: bool,
    /// The correlation token was already stored; nothing new was written
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub reader_id: Uuid,
    pub message_ids: Vec<Uuid>,
    pub read_at: DateTime<Utc>,
    pub marked: u64,
}

/// Append-only, strictly ordered per-conversation message records.
///
/// `append` is the single authorization boundary for writes: participant
/// membership and block relations are both checked here.
#[derive(Clone)]
pub struct MessageLog {
    messages: Arc<dyn MessageRepository>,
    conversations: ConversationStore,
    blocks: BlockRegistry,
    limits: EngineLimits,
}

impl MessageLog {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        conversations: ConversationStore,
        blocks: BlockRegistry,
        limits: EngineLimits,
    ) -> Self {
        Self {
            messages,
            conversations,
            blocks,
            limits,
        }
    }

    fn validate(
        &self,
        kind: MessageKind,
        content: &str,
        correlation_token: Option<&str>,
    ) -> AppResult<()> {
        if kind == MessageKind::User {
            if content.trim().is_empty() {
                return Err(AppError::BadRequest("message content is empty".into()));
            }
            if content.chars().count() > self.limits.max_message_length {
                return Err(AppError::BadRequest(format!(
                    "message content exceeds {} characters",
                    self.limits.max_message_length
                )));
            }
        }
        if let Some(token) = correlation_token {
            if token.is_empty() || token.len() > MAX_CORRELATION_TOKEN_LEN {
                return Err(AppError::BadRequest(format!(
                    "correlation token must be 1..={MAX_CORRELATION_TOKEN_LEN} characters"
                )));
            }
        }
        Ok(())
    }

    pub async fn append(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        kind: MessageKind,
        correlation_token: Option<String>,
    ) -> AppResult<Appended> {
        self.validate(kind, content, correlation_token.as_deref())?;

        let conversation = self
            .conversations
            .get_for_participant(conversation_id, sender_id)
            .await
            .inspect_err(|_| metrics::record_rejection("not_participant"))?;
        let recipient_id = conversation.require_counterpart(sender_id)?;

        if self.blocks.is_blocked(sender_id, recipient_id).await? {
            metrics::record_rejection("blocked");
            warn!(
                conversation_id = %conversation_id,
                sender_id = %sender_id,
                "append rejected: block relation between participants"
            );
            return Err(AppError::Blocked);
        }

        let message = match self
            .messages
            .append(NewMessage {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id,
                kind,
                content: content.trim().to_string(),
                correlation_token,
            })
            .await?
        {
            AppendOutcome::Appended(message) => message,
            AppendOutcome::Existing(message) => {
                debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    "resend of stored correlation token"
                );
                return Ok(Appended {
                    message,
                    conversation,
                    recipient_id,
                    activated: false,
                    replayed: true,
                });
            }
        };

        self.conversations
            .record_activity(conversation_id, message.created_at)
            .await?;
        let activated = self
            .conversations
            .activate_on_owner_send(&conversation, sender_id)
            .await?;
        if conversation.is_hidden_for(recipient_id) {
            self.conversations
                .resurface_for(conversation_id, recipient_id)
                .await?;
        }

        metrics::record_append(kind.to_db());
        info!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            sequence = message.sequence,
            kind = %kind,
            "message appended"
        );

        let mut conversation = conversation;
        conversation.updated_at = conversation.updated_at.max(message.created_at);
        if activated {
            conversation.activation = ActivationState::Active;
        }
        if let Some(membership) = conversation.participants.get_mut(&recipient_id) {
            membership.hidden_at = None;
        }

        Ok(Appended {
            message,
            conversation,
            recipient_id,
            activated,
            replayed: false,
        })
    }

    /// Mark every counterpart message that is unread right now.
    ///
    /// Selection happens before the update, so a message inserted in between
    /// stays unread. A second call with nothing new marks zero rows.
    pub async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> AppResult<ReadReceipt> {
        self.conversations
            .get_for_participant(conversation_id, reader_id)
            .await?;

        let message_ids = self.messages.unread_ids(conversation_id, reader_id).await?;
        let read_at = Utc::now();
        let marked = self.messages.mark_read(&message_ids, read_at).await?;

        debug!(
            conversation_id = %conversation_id,
            reader_id = %reader_id,
            marked,
            "messages marked read"
        );

        Ok(ReadReceipt {
            conversation_id,
            reader_id,
            message_ids,
            read_at,
            marked,
        })
    }

    /// Messages after `after` in `(created_at, sequence)` order
    pub async fn list(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        after: Option<MessageCursor>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Message>> {
        self.conversations
            .get_for_participant(conversation_id, viewer_id)
            .await?;
        let limit = limit
            .unwrap_or(self.limits.default_page_limit)
            .clamp(1, MAX_PAGE_LIMIT);
        self.messages.list(conversation_id, after, limit).await
    }

    pub async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        self.messages.last_message(conversation_id).await
    }

    pub async fn count_unread(&self, reader_id: Uuid, conversation_ids: &[Uuid]) -> AppResult<i64> {
        self.messages.count_unread(reader_id, conversation_ids).await
    }
}

//! Unread accounting and notification events for downstream collaborators.
//!
//! The dispatcher only emits. Delivering push or email is up to whoever
//! consumes the sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::conversation_store::ConversationStore;
use super::message_log::{Appended, MessageLog};
use crate::error::AppResult;
use crate::metrics;

pub const PREVIEW_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    NewMessage {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
        preview: String,
    },
    ListingFavorited {
        conversation_id: Uuid,
        listing_id: Uuid,
        recipient_id: Uuid,
        favorited_by: Uuid,
    },
}

impl NotificationEvent {
    pub fn recipient_id(&self) -> Uuid {
        match self {
            Self::NewMessage { recipient_id, .. } | Self::ListingFavorited { recipient_id, .. } => {
                *recipient_id
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::ListingFavorited { .. } => "listing_favorited",
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, event: &NotificationEvent) -> AppResult<()>;
}

/// In-process sink backed by a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<NotificationEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn emit(&self, event: &NotificationEvent) -> AppResult<()> {
        // No receivers is fine; nobody is listening in-process.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Default sink when no broker is configured
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn emit(&self, event: &NotificationEvent) -> AppResult<()> {
        info!(
            event = event.name(),
            recipient_id = %event.recipient_id(),
            "notification event"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    conversations: ConversationStore,
    log: MessageLog,
}

impl NotificationDispatcher {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        conversations: ConversationStore,
        log: MessageLog,
    ) -> Self {
        Self {
            sink,
            conversations,
            log,
        }
    }

    /// Counterpart messages with no read timestamp across the viewer's
    /// non-hidden conversations. Derived on every call.
    pub async fn unread_count(&self, viewer_id: Uuid) -> AppResult<i64> {
        let ids = self.conversations.visible_ids_for(viewer_id).await?;
        self.log.count_unread(viewer_id, &ids).await
    }

    /// Emit the event matching a successful append
    pub async fn message_appended(&self, appended: &Appended) {
        let message = &appended.message;
        if message.sender_id == appended.recipient_id {
            return;
        }

        let event = if message.is_system() {
            NotificationEvent::ListingFavorited {
                conversation_id: message.conversation_id,
                listing_id: appended.conversation.listing_id,
                recipient_id: appended.recipient_id,
                favorited_by: message.sender_id,
            }
        } else {
            NotificationEvent::NewMessage {
                conversation_id: message.conversation_id,
                message_id: message.id,
                sender_id: message.sender_id,
                recipient_id: appended.recipient_id,
                preview: truncate_message_preview(&message.content, PREVIEW_MAX_CHARS),
            }
        };
        self.emit(event).await;
    }

    /// Sink failures are logged and never surface to the sender
    async fn emit(&self, event: NotificationEvent) {
        match self.sink.emit(&event).await {
            Ok(()) => metrics::record_notification(event.name(), true),
            Err(e) => {
                metrics::record_notification(event.name(), false);
                warn!(
                    error = %e,
                    event = event.name(),
                    recipient_id = %event.recipient_id(),
                    "failed to emit notification event"
                );
            }
        }
    }
}

/// Truncate to `max_chars` characters, ending with an ellipsis when cut
pub fn truncate_message_preview(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        let truncated: String = message.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

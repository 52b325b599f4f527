pub mod block_registry;
pub mod chat_service;
pub mod conversation_store;
pub mod message_log;
pub mod notification_dispatcher;
#[cfg(feature = "kafka")]
pub mod notification_producer;

pub use block_registry::BlockRegistry;
pub use chat_service::{ChatService, ConversationDetail, FavoriteOutcome, Repositories};
pub use conversation_store::ConversationStore;
pub use message_log::{Appended, MessageLog, ReadReceipt};
pub use notification_dispatcher::{
    BroadcastSink, LogSink, NotificationDispatcher, NotificationEvent, NotificationSink,
};
#[cfg(feature = "kafka")]
pub use notification_producer::KafkaNotificationSink;

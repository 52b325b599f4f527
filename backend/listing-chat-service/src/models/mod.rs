pub mod block;
pub mod conversation;
pub mod message;

pub use block::{BlockRelation, BlockStatus};
pub use conversation::{
    ActivationState, Conversation, InboxEntry, InsertOutcome, Membership, NewConversation,
    ParticipantPair,
};
pub use message::{
    AppendOutcome, DeliveryStatus, Message, MessageCursor, MessageKind, NewMessage, HEART_CONTENT,
};

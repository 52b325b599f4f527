//! Per-conversation publish/subscribe feed.
//!
//! Delivery is at-least-once and arrival order is advisory: consumers sort by
//! the message cursor and de-duplicate by message id.

use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics;

pub mod backoff;
pub mod events;
pub mod streams;

pub use events::RealtimeEvent;
pub use streams::StreamRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<RealtimeEvent>,
}

type Registry = DashMap<Uuid, Vec<Subscriber>>;

fn remove_subscriber(registry: &Registry, conversation_id: Uuid, subscriber_id: SubscriberId) {
    let now_empty = match registry.get_mut(&conversation_id) {
        Some(mut subscribers) => {
            subscribers.retain(|s| s.id != subscriber_id);
            subscribers.is_empty()
        }
        None => return,
    };
    if now_empty {
        registry.remove_if(&conversation_id, |_, subs| subs.is_empty());
    }
    metrics::subscription_closed();
    debug!(conversation_id = %conversation_id, ?subscriber_id, "subscriber removed");
}

/// Local subscriber registry with an optional cross-instance relay
#[derive(Clone, Default)]
pub struct RealtimeSyncChannel {
    registry: Arc<Registry>,
    relay: Option<StreamRelay>,
}

impl RealtimeSyncChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also publish through Redis Streams so other instances see the events
    pub fn with_relay(relay: StreamRelay) -> Self {
        Self {
            registry: Arc::default(),
            relay: Some(relay),
        }
    }

    /// Start a fresh subscription scoped to one conversation. Dropping the
    /// returned handle unsubscribes.
    pub fn subscribe(&self, conversation_id: Uuid) -> Subscription {
        let (tx, rx) = unbounded_channel();
        let id = SubscriberId::new();
        self.registry
            .entry(conversation_id)
            .or_default()
            .push(Subscriber { id, sender: tx });
        metrics::subscription_opened();
        debug!(conversation_id = %conversation_id, subscriber_id = ?id, "subscriber added");

        Subscription {
            conversation_id,
            id,
            receiver: rx,
            registry: Arc::clone(&self.registry),
            closed: false,
        }
    }

    /// Deliver locally, then hand the event to the relay if one is attached.
    /// Relay failures are logged; local delivery has already happened.
    pub async fn publish(&self, event: RealtimeEvent) {
        self.deliver_local(&event);
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.publish(&event).await {
                warn!(
                    error = %e,
                    conversation_id = %event.conversation_id(),
                    "failed to relay realtime event"
                );
            }
        }
    }

    /// Fan out to this instance's subscribers, pruning dead senders
    pub fn deliver_local(&self, event: &RealtimeEvent) {
        let conversation_id = event.conversation_id();
        let pruned = match self.registry.get_mut(&conversation_id) {
            Some(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|s| s.sender.send(event.clone()).is_ok());
                before - subscribers.len()
            }
            None => 0,
        };
        if pruned > 0 {
            debug!(conversation_id = %conversation_id, pruned, "dead subscribers pruned");
        }
    }

    pub fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        self.registry
            .get(&conversation_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Cancellable, lazy sequence of events for one conversation
pub struct Subscription {
    conversation_id: Uuid,
    id: SubscriberId,
    receiver: UnboundedReceiver<RealtimeEvent>,
    registry: Arc<Registry>,
    closed: bool,
}

impl Subscription {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        if self.closed {
            return None;
        }
        self.receiver.recv().await
    }

    /// Stop delivery now; buffered events are discarded
    pub fn cancel(&mut self) {
        if !self.closed {
            self.closed = true;
            self.receiver.close();
            remove_subscriber(&self.registry, self.conversation_id, self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = RealtimeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MessageKind};
    use chrono::Utc;
    use futures::StreamExt;

    fn appended(conversation_id: Uuid) -> RealtimeEvent {
        RealtimeEvent::MessageAppended {
            message: Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: Uuid::new_v4(),
                kind: MessageKind::User,
                content: "hello".into(),
                sequence: 1,
                created_at: Utc::now(),
                read_at: None,
                correlation_token: None,
            },
        }
    }

    #[tokio::test]
    async fn test_subscription_scoped_to_conversation() {
        let channel = RealtimeSyncChannel::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut sub = channel.subscribe(a);

        channel.publish(appended(b)).await;
        let event = appended(a);
        channel.publish(event.clone()).await;

        assert_eq!(sub.next().await, Some(event));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let channel = RealtimeSyncChannel::new();
        let conversation_id = Uuid::new_v4();
        let sub = channel.subscribe(conversation_id);
        assert_eq!(channel.subscriber_count(conversation_id), 1);
        drop(sub);
        assert_eq!(channel.subscriber_count(conversation_id), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let channel = RealtimeSyncChannel::new();
        let conversation_id = Uuid::new_v4();
        let mut sub = channel.subscribe(conversation_id);
        sub.cancel();
        channel.publish(appended(conversation_id)).await;
        assert_eq!(sub.recv().await, None);
        assert_eq!(channel.subscriber_count(conversation_id), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_starts_clean() {
        let channel = RealtimeSyncChannel::new();
        let conversation_id = Uuid::new_v4();
        drop(channel.subscribe(conversation_id));
        channel.publish(appended(conversation_id)).await;

        let mut fresh = channel.subscribe(conversation_id);
        let event = appended(conversation_id);
        channel.publish(event.clone()).await;
        assert_eq!(fresh.recv().await, Some(event));
    }
}

// Engine integration tests
//
// Drives the full ChatService over the in-memory repositories:
// 1. Stable message ordering
// 2. Singleton conversations under concurrent first contact
// 3. Read receipts, blocks and hidden conversations
// 4. Activation and unread counts across both participants
// 5. Resends under one correlation token

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listing_chat_service::{
    config::EngineLimits,
    error::{AppError, AppResult},
    models::{ActivationState, Conversation, InsertOutcome, NewConversation, ParticipantPair},
    realtime::RealtimeSyncChannel,
    repository::{ConversationRepository, InMemoryConversations, InMemoryListings},
    services::{BroadcastSink, ChatService, ConversationStore, NotificationEvent, Repositories},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use uuid::Uuid;

struct Marketplace {
    chat: ChatService,
    notifications: tokio::sync::broadcast::Receiver<NotificationEvent>,
    listings: Arc<InMemoryListings>,
    listing_id: Uuid,
    seller: Uuid,
    buyer: Uuid,
}

async fn marketplace() -> Marketplace {
    let (repos, listings) = Repositories::in_memory();
    let sink = Arc::new(BroadcastSink::new(64));
    let notifications = sink.subscribe();
    let chat = ChatService::new(
        repos,
        RealtimeSyncChannel::new(),
        sink,
        EngineLimits::default(),
    );

    let listing_id = Uuid::new_v4();
    let seller = Uuid::new_v4();
    listings.register(listing_id, seller).await;

    Marketplace {
        chat,
        notifications,
        listings,
        listing_id,
        seller,
        buyer: Uuid::new_v4(),
    }
}

impl Marketplace {
    async fn open(&self) -> Uuid {
        self.chat
            .start_conversation(self.buyer, self.listing_id)
            .await
            .unwrap()
            .conversation
            .id
    }

    async fn send(&self, sender: Uuid, conversation_id: Uuid, content: &str) -> AppResult<()> {
        self.chat
            .send_message(sender, conversation_id, content, None)
            .await
            .map(|_| ())
    }
}

#[tokio::test]
async fn test_message_order_is_stable_across_reads() {
    let m = marketplace().await;
    let conversation_id = m.open().await;

    for i in 0..20 {
        let sender = if i % 3 == 0 { m.seller } else { m.buyer };
        m.send(sender, conversation_id, &format!("message {i}"))
            .await
            .unwrap();
    }

    let first = m
        .chat
        .list_messages(m.buyer, conversation_id, None, Some(200))
        .await
        .unwrap();
    let second = m
        .chat
        .list_messages(m.seller, conversation_id, None, Some(200))
        .await
        .unwrap();

    assert_eq!(first.len(), 20);
    let ids = |messages: &[listing_chat_service::models::Message]| {
        messages.iter().map(|msg| msg.id).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    assert!(first.windows(2).all(|w| w[0].cursor() < w[1].cursor()));
}

#[tokio::test]
async fn test_paging_after_cursor_resumes_without_gaps() {
    let m = marketplace().await;
    let conversation_id = m.open().await;
    for i in 0..7 {
        m.send(m.buyer, conversation_id, &format!("m{i}")).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut after = None;
    loop {
        let page = m
            .chat
            .list_messages(m.seller, conversation_id, after, Some(3))
            .await
            .unwrap();
        if page.is_empty() {
            break;
        }
        after = page.last().map(|msg| msg.cursor());
        seen.extend(page.into_iter().map(|msg| msg.content));
    }
    let expected: Vec<String> = (0..7).map(|i| format!("m{i}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_yields_one_conversation() {
    let m = marketplace().await;
    let chat_a = m.chat.clone();
    let chat_b = m.chat.clone();
    let (buyer, seller, listing_id) = (m.buyer, m.seller, m.listing_id);

    // Double-tap on "message seller" from two devices
    let from_buyer = tokio::spawn(async move { chat_a.start_conversation(buyer, listing_id).await });
    let from_buyer_again =
        tokio::spawn(async move { chat_b.start_conversation(buyer, listing_id).await });

    let a = from_buyer.await.unwrap().unwrap();
    let b = from_buyer_again.await.unwrap().unwrap();
    assert_eq!(a.conversation.id, b.conversation.id);

    let inbox = m.chat.inbox(seller).await.unwrap();
    assert_eq!(inbox.len(), 1);
}

/// Holds the first two lookups until both callers have missed, so both go on
/// to insert and one of them must lose on the uniqueness constraint.
struct RacyConversations {
    inner: InMemoryConversations,
    gate: Barrier,
    lookups: AtomicUsize,
    conflicts: AtomicUsize,
}

#[async_trait]
impl ConversationRepository for RacyConversations {
    async fn find_by_key(
        &self,
        listing_id: Uuid,
        pair: ParticipantPair,
    ) -> AppResult<Option<Conversation>> {
        let found = self.inner.find_by_key(listing_id, pair).await?;
        if self.lookups.fetch_add(1, Ordering::SeqCst) < 2 {
            self.gate.wait().await;
        }
        Ok(found)
    }

    async fn insert(&self, new: &NewConversation) -> AppResult<InsertOutcome> {
        let outcome = self.inner.insert(new).await?;
        if matches!(outcome, InsertOutcome::Conflict) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn get(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        self.inner.get(conversation_id).await
    }

    async fn set_hidden(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        hidden: bool,
    ) -> AppResult<bool> {
        self.inner.set_hidden(conversation_id, user_id, hidden).await
    }

    async fn touch(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.inner.touch(conversation_id, at).await
    }

    async fn activate(&self, conversation_id: Uuid) -> AppResult<bool> {
        self.inner.activate(conversation_id).await
    }

    async fn list_visible_for(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Conversation>> {
        self.inner.list_visible_for(user_id, limit).await
    }

    async fn visible_ids_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.inner.visible_ids_for(user_id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_create_race_retries_as_lookup() {
    let repo = Arc::new(RacyConversations {
        inner: InMemoryConversations::new(),
        gate: Barrier::new(2),
        lookups: AtomicUsize::new(0),
        conflicts: AtomicUsize::new(0),
    });
    let listings = Arc::new(InMemoryListings::new());
    let store = ConversationStore::new(repo.clone(), listings.clone());

    let listing_id = Uuid::new_v4();
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    listings.register(listing_id, seller).await;

    // Both users make first contact at once, in opposite argument order
    let store_a = store.clone();
    let store_b = store.clone();
    let a = tokio::spawn(async move { store_a.get_or_create(listing_id, buyer, seller).await });
    let b = tokio::spawn(async move { store_b.get_or_create(listing_id, seller, buyer).await });

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(repo.conflicts.load(Ordering::SeqCst), 1);
    assert_eq!(repo.inner.len().await, 1);
}

#[tokio::test]
async fn test_mark_read_is_idempotent() {
    let m = marketplace().await;
    let conversation_id = m.open().await;
    m.send(m.seller, conversation_id, "still available").await.unwrap();
    m.send(m.seller, conversation_id, "yes").await.unwrap();

    let first = m.chat.mark_read(m.buyer, conversation_id).await.unwrap();
    assert_eq!(first.marked, 2);
    let after_first = m
        .chat
        .list_messages(m.buyer, conversation_id, None, None)
        .await
        .unwrap();

    let second = m.chat.mark_read(m.buyer, conversation_id).await.unwrap();
    assert_eq!(second.marked, 0);
    let after_second = m
        .chat
        .list_messages(m.buyer, conversation_id, None, None)
        .await
        .unwrap();

    assert_eq!(after_first, after_second);
    assert_eq!(m.chat.unread_count(m.buyer).await.unwrap(), 0);
}

#[tokio::test]
async fn test_resend_after_lost_response_stores_one_message() {
    let mut m = marketplace().await;
    let conversation_id = m.open().await;
    let token = Some("tok-lost-response".to_string());

    let first = m
        .chat
        .send_message(m.buyer, conversation_id, "Is it available?", token.clone())
        .await
        .unwrap();
    // The response never reached the client, so it resends under the same token
    let resent = m
        .chat
        .send_message(m.buyer, conversation_id, "Is it available?", token)
        .await
        .unwrap();
    assert_eq!(resent.id, first.id);
    assert_eq!(resent.sequence, first.sequence);

    let messages = m
        .chat
        .list_messages(m.seller, conversation_id, None, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(m.chat.unread_count(m.seller).await.unwrap(), 1);

    assert_eq!(m.notifications.recv().await.unwrap().recipient_id(), m.seller);
    assert!(m.notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_block_rejects_then_unblock_restores_sending() {
    let m = marketplace().await;
    let conversation_id = m.open().await;
    m.send(m.buyer, conversation_id, "is this still for sale?")
        .await
        .unwrap();

    m.chat.block_user(m.seller, m.buyer).await.unwrap();
    assert_eq!(
        m.send(m.buyer, conversation_id, "hello?").await,
        Err(AppError::Blocked)
    );
    // Blocking silences the blocker too
    assert_eq!(
        m.send(m.seller, conversation_id, "bye").await,
        Err(AppError::Blocked)
    );

    let detail = m
        .chat
        .conversation_detail(m.buyer, conversation_id)
        .await
        .unwrap();
    assert!(detail.blocked);
    assert!(detail.block_status.is_blocked_by);
    assert!(!detail.block_status.is_blocking);

    m.chat.unblock_user(m.seller, m.buyer).await.unwrap();
    m.send(m.buyer, conversation_id, "hello?").await.unwrap();

    let messages = m
        .chat
        .list_messages(m.seller, conversation_id, None, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn test_hiding_affects_only_the_hiding_participant() {
    let m = marketplace().await;
    let conversation_id = m.open().await;
    m.send(m.buyer, conversation_id, "hi").await.unwrap();

    m.chat
        .hide_conversation(m.buyer, conversation_id)
        .await
        .unwrap();

    assert!(m.chat.inbox(m.buyer).await.unwrap().is_empty());
    let seller_inbox = m.chat.inbox(m.seller).await.unwrap();
    assert_eq!(seller_inbox.len(), 1);
    assert_eq!(seller_inbox[0].conversation_id, conversation_id);

    // The other side can still read and reply
    let messages = m
        .chat
        .list_messages(m.seller, conversation_id, None, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    m.send(m.seller, conversation_id, "sure").await.unwrap();

    // A reply brings the thread back for the participant who hid it
    let buyer_inbox = m.chat.inbox(m.buyer).await.unwrap();
    assert_eq!(buyer_inbox.len(), 1);
    assert_eq!(buyer_inbox[0].unread_count, 1);
}

#[tokio::test]
async fn test_activation_and_unread_scenario() {
    let mut m = marketplace().await;
    let conversation_id = m.open().await;

    let detail = m
        .chat
        .conversation_detail(m.buyer, conversation_id)
        .await
        .unwrap();
    assert_eq!(detail.conversation.activation, ActivationState::Inactive);

    m.send(m.buyer, conversation_id, "Hi").await.unwrap();
    let detail = m
        .chat
        .conversation_detail(m.buyer, conversation_id)
        .await
        .unwrap();
    assert_eq!(detail.conversation.activation, ActivationState::Inactive);
    assert_eq!(m.chat.unread_count(m.seller).await.unwrap(), 1);
    assert_eq!(m.chat.unread_count(m.buyer).await.unwrap(), 0);

    m.send(m.seller, conversation_id, "Hello").await.unwrap();
    let detail = m
        .chat
        .conversation_detail(m.seller, conversation_id)
        .await
        .unwrap();
    assert_eq!(detail.conversation.activation, ActivationState::Active);
    assert_eq!(m.chat.unread_count(m.buyer).await.unwrap(), 1);

    m.chat.mark_read(m.buyer, conversation_id).await.unwrap();
    assert_eq!(m.chat.unread_count(m.buyer).await.unwrap(), 0);
    assert_eq!(m.chat.unread_count(m.seller).await.unwrap(), 1);

    // One notification per append, addressed to the counterpart
    let first = m.notifications.recv().await.unwrap();
    let second = m.notifications.recv().await.unwrap();
    assert_eq!(first.recipient_id(), m.seller);
    assert_eq!(second.recipient_id(), m.buyer);
}

#[tokio::test]
async fn test_favorite_heart_counts_as_unread_for_owner() {
    let mut m = marketplace().await;

    let outcome = m
        .chat
        .favorite_listing(m.buyer, m.listing_id)
        .await
        .unwrap();
    let heart = outcome.icebreaker.expect("icebreaker appended");
    assert!(heart.is_system());
    assert_eq!(m.chat.unread_count(m.seller).await.unwrap(), 1);

    match m.notifications.recv().await.unwrap() {
        NotificationEvent::ListingFavorited {
            listing_id,
            recipient_id,
            favorited_by,
            ..
        } => {
            assert_eq!(listing_id, m.listing_id);
            assert_eq!(recipient_id, m.seller);
            assert_eq!(favorited_by, m.buyer);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_listing_and_own_listing_are_rejected() {
    let m = marketplace().await;
    assert_eq!(
        m.chat
            .start_conversation(m.buyer, Uuid::new_v4())
            .await
            .unwrap_err(),
        AppError::NotFound("listing")
    );
    assert!(matches!(
        m.chat.start_conversation(m.seller, m.listing_id).await,
        Err(AppError::BadRequest(_))
    ));

    // A second listing by the same seller is a separate thread
    let other_listing = Uuid::new_v4();
    m.listings.register(other_listing, m.seller).await;
    let first = m.open().await;
    let second = m
        .chat
        .start_conversation(m.buyer, other_listing)
        .await
        .unwrap();
    assert_ne!(first, second.conversation.id);
}

#[tokio::test]
async fn test_outsider_cannot_read_or_write() {
    let m = marketplace().await;
    let conversation_id = m.open().await;
    let outsider = Uuid::new_v4();

    assert_eq!(
        m.send(outsider, conversation_id, "hey").await,
        Err(AppError::Forbidden)
    );
    assert_eq!(
        m.chat
            .list_messages(outsider, conversation_id, None, None)
            .await
            .unwrap_err(),
        AppError::Forbidden
    );
    assert!(m.chat.subscribe(outsider, conversation_id).await.is_err());
}

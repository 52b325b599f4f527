// PostgreSQL repository tests
//
// Needs a scratch database: TEST_DATABASE_URL=postgres://... cargo test -- --ignored
// Every test works on fresh random ids, so runs do not interfere.

use listing_chat_service::{
    config::EngineLimits,
    db,
    error::AppError,
    realtime::RealtimeSyncChannel,
    services::{ChatService, LogSink, Repositories},
};
use std::sync::Arc;
use uuid::Uuid;

async fn pg_chat() -> Option<(ChatService, deadpool_postgres::Pool)> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = db::init_pool(&url, 8).await.expect("test database");
    let chat = ChatService::new(
        Repositories::postgres(pool.clone()),
        RealtimeSyncChannel::new(),
        Arc::new(LogSink),
        EngineLimits::default(),
    );
    Some((chat, pool))
}

async fn register_listing(pool: &deadpool_postgres::Pool, owner: Uuid) -> Uuid {
    let listing_id = Uuid::new_v4();
    let client = pool.get().await.unwrap();
    client
        .execute(
            "INSERT INTO listings (id, owner_id) VALUES ($1, $2)",
            &[&listing_id, &owner],
        )
        .await
        .unwrap();
    listing_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // requires TEST_DATABASE_URL
async fn test_pg_concurrent_start_is_singleton() {
    let Some((chat, pool)) = pg_chat().await else {
        return;
    };
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let listing_id = register_listing(&pool, seller).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let chat = chat.clone();
            tokio::spawn(async move { chat.start_conversation(buyer, listing_id).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().conversation.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let client = pool.get().await.unwrap();
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM conversations WHERE listing_id = $1",
            &[&listing_id],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // requires TEST_DATABASE_URL
async fn test_pg_concurrent_appends_get_distinct_ordered_positions() {
    let Some((chat, pool)) = pg_chat().await else {
        return;
    };
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let listing_id = register_listing(&pool, seller).await;
    let conversation_id = chat
        .start_conversation(buyer, listing_id)
        .await
        .unwrap()
        .conversation
        .id;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let chat = chat.clone();
            let sender = if i % 2 == 0 { buyer } else { seller };
            tokio::spawn(async move {
                chat.send_message(sender, conversation_id, &format!("m{i}"), None)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let first = chat
        .list_messages(buyer, conversation_id, None, Some(200))
        .await
        .unwrap();
    let second = chat
        .list_messages(seller, conversation_id, None, Some(200))
        .await
        .unwrap();
    assert_eq!(first.len(), 20);
    assert_eq!(first, second);
    assert!(first.windows(2).all(|w| w[0].cursor() < w[1].cursor()));
    let mut sequences: Vec<i64> = first.iter().map(|m| m.sequence).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
#[ignore] // requires TEST_DATABASE_URL
async fn test_pg_block_read_and_hide() {
    let Some((chat, pool)) = pg_chat().await else {
        return;
    };
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let listing_id = register_listing(&pool, seller).await;
    let conversation_id = chat
        .start_conversation(buyer, listing_id)
        .await
        .unwrap()
        .conversation
        .id;

    chat.send_message(buyer, conversation_id, "Hi", None)
        .await
        .unwrap();
    assert_eq!(chat.unread_count(seller).await.unwrap(), 1);

    chat.send_message(seller, conversation_id, "Hello", None)
        .await
        .unwrap();
    let detail = chat.conversation_detail(buyer, conversation_id).await.unwrap();
    assert!(detail.conversation.activation.is_active());

    assert_eq!(chat.mark_read(seller, conversation_id).await.unwrap().marked, 1);
    assert_eq!(chat.mark_read(seller, conversation_id).await.unwrap().marked, 0);

    chat.block_user(buyer, seller).await.unwrap();
    assert_eq!(
        chat.send_message(seller, conversation_id, "?", None).await,
        Err(AppError::Blocked)
    );
    chat.unblock_user(buyer, seller).await.unwrap();

    chat.hide_conversation(seller, conversation_id).await.unwrap();
    assert!(chat
        .inbox(seller)
        .await
        .unwrap()
        .iter()
        .all(|entry| entry.conversation_id != conversation_id));
    assert!(chat
        .inbox(buyer)
        .await
        .unwrap()
        .iter()
        .any(|entry| entry.conversation_id == conversation_id));
}

#[tokio::test]
#[ignore] // requires TEST_DATABASE_URL
async fn test_pg_resend_with_same_token_is_stored_once() {
    let Some((chat, pool)) = pg_chat().await else {
        return;
    };
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let listing_id = register_listing(&pool, seller).await;
    let conversation_id = chat
        .start_conversation(buyer, listing_id)
        .await
        .unwrap()
        .conversation
        .id;

    let token = Some("tok-pg".to_string());
    let first = chat
        .send_message(buyer, conversation_id, "Hi", token.clone())
        .await
        .unwrap();
    let again = chat
        .send_message(buyer, conversation_id, "Hi", token)
        .await
        .unwrap();
    assert_eq!(again.id, first.id);

    let next = chat
        .send_message(buyer, conversation_id, "Anyone?", None)
        .await
        .unwrap();
    assert_eq!(next.sequence, first.sequence + 1);
    assert_eq!(chat.unread_count(seller).await.unwrap(), 2);
}

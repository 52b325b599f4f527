// HTTP API tests
//
// Exercises the actix routes end to end over in-memory storage:
// identity header handling, the send/list/read flow, blocks and favorites.

use actix_web::{http::StatusCode, test, web, App};
use listing_chat_service::{
    config::{Config, EngineLimits, LogFormat},
    models::Message,
    realtime::RealtimeSyncChannel,
    routes,
    services::{ChatService, LogSink, Repositories},
    state::AppState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

struct Fixture {
    state: AppState,
    listing_id: Uuid,
    seller: Uuid,
    buyer: Uuid,
}

async fn fixture() -> Fixture {
    let (repos, listings) = Repositories::in_memory();
    let chat = ChatService::new(
        repos,
        RealtimeSyncChannel::new(),
        Arc::new(LogSink),
        EngineLimits::default(),
    );
    let listing_id = Uuid::new_v4();
    let seller = Uuid::new_v4();
    listings.register(listing_id, seller).await;

    let config = Config {
        database_url: None,
        db_max_connections: 4,
        redis_url: None,
        port: 0,
        kafka: None,
        limits: EngineLimits::default(),
        log_format: LogFormat::Pretty,
        seed_listings: Vec::new(),
    };

    Fixture {
        state: AppState {
            chat,
            config: Arc::new(config),
            redis: None,
        },
        listing_id,
        seller,
        buyer: Uuid::new_v4(),
    }
}

macro_rules! app {
    ($fixture:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($fixture.state.clone()))
                .configure(routes::configure),
        )
        .await
    };
}

fn as_user(req: test::TestRequest, user: Uuid) -> test::TestRequest {
    req.insert_header(("x-user-id", user.to_string()))
}

#[actix_web::test]
async fn test_missing_identity_is_unauthorized() {
    let f = fixture().await;
    let app = app!(f);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/conversations").to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "unauthorized");
}

#[actix_web::test]
async fn test_send_list_and_read_flow() {
    let f = fixture().await;
    let app = app!(f);

    let req = as_user(test::TestRequest::post().uri("/api/v1/conversations"), f.buyer)
        .set_json(json!({ "listing_id": f.listing_id }))
        .to_request();
    let detail: Value = test::call_and_read_body_json(&app, req).await;
    let conversation_id = detail["id"].as_str().unwrap().to_string();
    assert_eq!(detail["counterpart_id"], f.seller.to_string());
    assert_eq!(detail["activation"], "inactive");
    assert_eq!(detail["blocked"], false);

    let req = as_user(
        test::TestRequest::post().uri(&format!("/api/v1/conversations/{conversation_id}/messages")),
        f.buyer,
    )
    .set_json(json!({ "content": "  Hi there  ", "correlation_token": "tok-1" }))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let sent: Message = test::read_body_json(resp).await;
    assert_eq!(sent.content, "Hi there");
    assert_eq!(sent.correlation_token.as_deref(), Some("tok-1"));

    let req = as_user(test::TestRequest::get().uri("/api/v1/unread-count"), f.seller).to_request();
    let unread: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(unread["unread_count"], 1);

    let req = as_user(
        test::TestRequest::get().uri(&format!("/api/v1/conversations/{conversation_id}/messages")),
        f.seller,
    )
    .to_request();
    let messages: Vec<Message> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, sent.id);

    let req = as_user(
        test::TestRequest::post().uri(&format!("/api/v1/conversations/{conversation_id}/read")),
        f.seller,
    )
    .to_request();
    let receipt: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(receipt["marked"], 1);

    let req = as_user(test::TestRequest::get().uri("/api/v1/unread-count"), f.seller).to_request();
    let unread: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(unread["unread_count"], 0);
}

#[actix_web::test]
async fn test_half_cursor_is_rejected() {
    let f = fixture().await;
    let app = app!(f);
    let conversation_id = f
        .state
        .chat
        .start_conversation(f.buyer, f.listing_id)
        .await
        .unwrap()
        .conversation
        .id;

    let req = as_user(
        test::TestRequest::get()
            .uri(&format!("/api/v1/conversations/{conversation_id}/messages?after_sequence=3")),
        f.buyer,
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_blocked_send_returns_distinct_code() {
    let f = fixture().await;
    let app = app!(f);
    let conversation_id = f
        .state
        .chat
        .start_conversation(f.buyer, f.listing_id)
        .await
        .unwrap()
        .conversation
        .id;

    let req = as_user(test::TestRequest::post().uri("/api/v1/blocks"), f.seller)
        .set_json(json!({ "user_id": f.buyer }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    let req = as_user(test::TestRequest::get().uri("/api/v1/blocks"), f.seller).to_request();
    let blocked: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0]["user_id"], f.buyer.to_string());
    let req = as_user(test::TestRequest::get().uri("/api/v1/blocks"), f.buyer).to_request();
    let blocked: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert!(blocked.is_empty());

    let req = as_user(
        test::TestRequest::post().uri(&format!("/api/v1/conversations/{conversation_id}/messages")),
        f.buyer,
    )
    .set_json(json!({ "content": "hello?" }))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "blocked");

    let req = as_user(
        test::TestRequest::get().uri(&format!("/api/v1/blocks/{}", f.seller)),
        f.buyer,
    )
    .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["blocked"], true);
    assert_eq!(status["is_blocked_by"], true);
    assert_eq!(status["is_blocking"], false);

    // Favoriting while blocked succeeds without an icebreaker
    let req = as_user(
        test::TestRequest::post().uri(&format!("/api/v1/listings/{}/favorite", f.listing_id)),
        f.buyer,
    )
    .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert!(outcome["icebreaker"].is_null());
}

#[actix_web::test]
async fn test_outsider_is_forbidden_and_unknown_is_not_found() {
    let f = fixture().await;
    let app = app!(f);
    let conversation_id = f
        .state
        .chat
        .start_conversation(f.buyer, f.listing_id)
        .await
        .unwrap()
        .conversation
        .id;

    let req = as_user(
        test::TestRequest::get().uri(&format!("/api/v1/conversations/{conversation_id}")),
        Uuid::new_v4(),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "forbidden");

    let req = as_user(
        test::TestRequest::get().uri(&format!("/api/v1/conversations/{}", Uuid::new_v4())),
        f.buyer,
    )
    .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_hide_removes_from_own_inbox_only() {
    let f = fixture().await;
    let app = app!(f);
    let conversation_id = f
        .state
        .chat
        .start_conversation(f.buyer, f.listing_id)
        .await
        .unwrap()
        .conversation
        .id;

    let req = as_user(
        test::TestRequest::delete().uri(&format!("/api/v1/conversations/{conversation_id}")),
        f.buyer,
    )
    .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    let req = as_user(test::TestRequest::get().uri("/api/v1/conversations"), f.buyer).to_request();
    let inbox: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert!(inbox.is_empty());

    let req = as_user(test::TestRequest::get().uri("/api/v1/conversations"), f.seller).to_request();
    let inbox: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(inbox.len(), 1);
}

#[actix_web::test]
async fn test_health_is_ok_in_memory() {
    let f = fixture().await;
    let app = app!(f);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

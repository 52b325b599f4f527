pub mod blocks;
pub mod conversations;
pub mod favorites;
pub mod wsroute;

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::{metrics, state::AppState};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(conversations::start_conversation)
            .service(conversations::list_conversations)
            .service(conversations::get_conversation)
            .service(conversations::hide_conversation)
            .service(conversations::list_messages)
            .service(conversations::send_message)
            .service(conversations::mark_read)
            .service(conversations::unread_count)
            .service(blocks::block_user)
            .service(blocks::list_blocked)
            .service(blocks::unblock_user)
            .service(blocks::block_status)
            .service(favorites::favorite_listing)
            .service(wsroute::ws_handler),
    )
    .route("/health", web::get().to(health))
    .route("/metrics", web::get().to(metrics::metrics_handler));
}

/// GET /health
/// 503 when storage or the relay cannot be reached
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let storage = state.chat.health_check().await;
    let relay = match &state.redis {
        Some(redis) => redis.ping().await.map_err(|e| e.to_string()),
        None => Ok(()),
    };

    match (storage, relay) {
        (Ok(()), Ok(())) => HttpResponse::Ok().json(json!({ "status": "ok" })),
        (storage, relay) => {
            tracing::warn!(?storage, ?relay, "health check failed");
            HttpResponse::ServiceUnavailable().json(json!({
                "status": "degraded",
                "storage": storage.is_ok(),
                "relay": relay.is_ok(),
            }))
        }
    }
}

use crate::{error::AppError, middleware::guards::User, state::AppState};
use actix_web::{delete, get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct BlockRequest {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct BlockedUser {
    pub user_id: Uuid,
    pub blocked_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct BlockStatusResponse {
    pub user_id: Uuid,
    pub blocked: bool,
    pub is_blocking: bool,
    pub is_blocked_by: bool,
}

/// POST /blocks
/// Idempotent
#[post("/blocks")]
pub async fn block_user(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<BlockRequest>,
) -> Result<HttpResponse, AppError> {
    state.chat.block_user(user.id, body.user_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[delete("/blocks/{user_id}")]
pub async fn unblock_user(
    state: web::Data<AppState>,
    user: User,
    target: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    state.chat.unblock_user(user.id, target.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /blocks
/// Users the caller has blocked
#[get("/blocks")]
pub async fn list_blocked(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let blocked: Vec<BlockedUser> = state
        .chat
        .blocked_users(user.id)
        .await?
        .into_iter()
        .map(|relation| BlockedUser {
            user_id: relation.blocked_id,
            blocked_at: relation.created_at,
        })
        .collect();
    Ok(HttpResponse::Ok().json(blocked))
}

#[get("/blocks/{user_id}")]
pub async fn block_status(
    state: web::Data<AppState>,
    user: User,
    target: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let target = target.into_inner();
    let status = state.chat.block_status(user.id, target).await?;
    Ok(HttpResponse::Ok().json(BlockStatusResponse {
        user_id: target,
        blocked: status.is_blocked(),
        is_blocking: status.is_blocking,
        is_blocked_by: status.is_blocked_by,
    }))
}

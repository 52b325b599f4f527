use crate::{
    error::AppError, middleware::guards::User, models::MessageCursor, state::AppState,
};
use actix_web::{delete, get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct StartConversationRequest {
    pub listing_id: Uuid,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub correlation_token: Option<String>,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub after_created_at: Option<DateTime<Utc>>,
    pub after_sequence: Option<i64>,
    pub limit: Option<i64>,
}

impl MessagesQuery {
    /// Both cursor halves or neither
    fn cursor(&self) -> Result<Option<MessageCursor>, AppError> {
        match (self.after_created_at, self.after_sequence) {
            (Some(created_at), Some(sequence)) => Ok(Some(MessageCursor {
                created_at,
                sequence,
            })),
            (None, None) => Ok(None),
            _ => Err(AppError::BadRequest(
                "after_created_at and after_sequence must be given together".into(),
            )),
        }
    }
}

#[derive(Serialize)]
pub struct MarkReadResponse {
    pub conversation_id: Uuid,
    pub marked: u64,
    pub read_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}

/// POST /conversations
/// Get or create the conversation with the listing owner
#[post("/conversations")]
pub async fn start_conversation(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<StartConversationRequest>,
) -> Result<HttpResponse, AppError> {
    let detail = state
        .chat
        .start_conversation(user.id, body.listing_id)
        .await?;
    Ok(HttpResponse::Ok().json(detail))
}

/// GET /conversations
/// Inbox: non-hidden conversations, most recently active first
#[get("/conversations")]
pub async fn list_conversations(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let inbox = state.chat.inbox(user.id).await?;
    Ok(HttpResponse::Ok().json(inbox))
}

#[get("/conversations/{id}")]
pub async fn get_conversation(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let detail = state
        .chat
        .conversation_detail(user.id, conversation_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(detail))
}

/// DELETE /conversations/{id}
/// Hides the conversation for the caller only
#[delete("/conversations/{id}")]
pub async fn hide_conversation(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    state
        .chat
        .hide_conversation(user.id, conversation_id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/conversations/{id}/messages")]
pub async fn list_messages(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    query: web::Query<MessagesQuery>,
) -> Result<HttpResponse, AppError> {
    let messages = state
        .chat
        .list_messages(
            user.id,
            conversation_id.into_inner(),
            query.cursor()?,
            query.limit,
        )
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// POST /conversations/{id}/messages
/// Returns the stored message, echoing the caller's correlation token
#[post("/conversations/{id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let message = state
        .chat
        .send_message(
            user.id,
            conversation_id.into_inner(),
            &body.content,
            body.correlation_token,
        )
        .await?;
    Ok(HttpResponse::Created().json(message))
}

#[post("/conversations/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let receipt = state
        .chat
        .mark_read(user.id, conversation_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(MarkReadResponse {
        conversation_id: receipt.conversation_id,
        marked: receipt.marked,
        read_at: receipt.read_at,
    }))
}

#[get("/unread-count")]
pub async fn unread_count(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let unread_count = state.chat.unread_count(user.id).await?;
    Ok(HttpResponse::Ok().json(UnreadCountResponse { unread_count }))
}

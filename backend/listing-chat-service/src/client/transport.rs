use async_trait::async_trait;
use futures::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue, Message as WsMessage};
use tracing::warn;
use uuid::Uuid;

use super::connection::ConnectionContext;
use crate::error::{AppError, AppResult};
use crate::middleware::guards::USER_ID_HEADER;
use crate::models::{Message, MessageCursor};
use crate::realtime::RealtimeEvent;
use crate::services::ChatService;

pub type EventStream = Pin<Box<dyn Stream<Item = RealtimeEvent> + Send>>;

/// What a conversation view needs from the service, whichever side of the
/// network it is on.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn viewer(&self) -> Uuid;

    async fn send(
        &self,
        conversation_id: Uuid,
        content: &str,
        correlation_token: &str,
    ) -> AppResult<Message>;

    /// Messages strictly after `after`, ascending
    async fn fetch_after(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    async fn mark_read(&self, conversation_id: Uuid) -> AppResult<u64>;

    /// Live events; the stream ends when the connection drops
    async fn subscribe(&self, conversation_id: Uuid) -> AppResult<EventStream>;
}

/// In-process transport, used when the view runs next to the service
#[derive(Clone)]
pub struct LocalTransport {
    chat: ChatService,
    viewer: Uuid,
}

impl LocalTransport {
    pub fn new(chat: ChatService, viewer: Uuid) -> Self {
        Self { chat, viewer }
    }
}

#[async_trait]
impl ChatTransport for LocalTransport {
    fn viewer(&self) -> Uuid {
        self.viewer
    }

    async fn send(
        &self,
        conversation_id: Uuid,
        content: &str,
        correlation_token: &str,
    ) -> AppResult<Message> {
        self.chat
            .send_message(
                self.viewer,
                conversation_id,
                content,
                Some(correlation_token.to_string()),
            )
            .await
    }

    async fn fetch_after(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        self.chat
            .list_messages(self.viewer, conversation_id, after, Some(limit))
            .await
    }

    async fn mark_read(&self, conversation_id: Uuid) -> AppResult<u64> {
        let receipt = self.chat.mark_read(self.viewer, conversation_id).await?;
        Ok(receipt.marked)
    }

    async fn subscribe(&self, conversation_id: Uuid) -> AppResult<EventStream> {
        let subscription = self.chat.subscribe(self.viewer, conversation_id).await?;
        Ok(Box::pin(subscription))
    }
}

#[derive(Serialize)]
struct SendBody<'a> {
    content: &'a str,
    correlation_token: &'a str,
}

#[derive(Deserialize)]
struct MarkReadBody {
    marked: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

/// REST for requests, WebSocket for the live feed
#[derive(Clone)]
pub struct HttpTransport {
    ctx: ConnectionContext,
}

impl HttpTransport {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn viewer(&self) -> Uuid {
        self.ctx.user_id()
    }

    async fn send(
        &self,
        conversation_id: Uuid,
        content: &str,
        correlation_token: &str,
    ) -> AppResult<Message> {
        let response = self
            .ctx
            .http()
            .post(self.ctx.api_url(&format!("conversations/{conversation_id}/messages")))
            .json(&SendBody {
                content,
                correlation_token,
            })
            .send()
            .await?;
        read_json(response).await
    }

    async fn fetch_after(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = after {
            query.push(("after_created_at", cursor.created_at.to_rfc3339()));
            query.push(("after_sequence", cursor.sequence.to_string()));
        }
        let response = self
            .ctx
            .http()
            .get(self.ctx.api_url(&format!("conversations/{conversation_id}/messages")))
            .query(&query)
            .send()
            .await?;
        read_json(response).await
    }

    async fn mark_read(&self, conversation_id: Uuid) -> AppResult<u64> {
        let response = self
            .ctx
            .http()
            .post(self.ctx.api_url(&format!("conversations/{conversation_id}/read")))
            .send()
            .await?;
        let body: MarkReadBody = read_json(response).await?;
        Ok(body.marked)
    }

    async fn subscribe(&self, conversation_id: Uuid) -> AppResult<EventStream> {
        let mut request = self
            .ctx
            .ws_url(conversation_id)
            .into_client_request()
            .map_err(|e| AppError::BadRequest(format!("websocket url: {e}")))?;
        let user_id = HeaderValue::from_str(&self.ctx.user_id().to_string())
            .map_err(|e| AppError::BadRequest(format!("user id header: {e}")))?;
        request.headers_mut().insert(USER_ID_HEADER, user_id);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("websocket: {e}")))?;

        let events = socket
            .take_while(|frame| future::ready(frame.is_ok()))
            .filter_map(|frame| async move {
                match frame {
                    Ok(WsMessage::Text(text)) => match RealtimeEvent::from_json(text.as_str()) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable realtime frame");
                            None
                        }
                    },
                    _ => None,
                }
            });
        Ok(Box::pin(events))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> AppResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.json::<ErrorBody>().await.ok();
    Err(error_from_response(status.as_u16(), body))
}

/// Rebuild the service error from its wire form
fn error_from_response(status: u16, body: Option<ErrorBody>) -> AppError {
    let (message, code) = match body {
        Some(ErrorBody { error, code }) => (error, code),
        None => (format!("status {status}"), String::new()),
    };
    match code.as_str() {
        "blocked" => AppError::Blocked,
        "forbidden" => AppError::Forbidden,
        "unauthorized" => AppError::Unauthorized,
        "not_found" => AppError::NotFound("resource"),
        "validation" => AppError::BadRequest(message),
        "timeout" => AppError::Timeout(message),
        "unavailable" => AppError::ServiceUnavailable(message),
        _ => match status {
            400 => AppError::BadRequest(message),
            401 => AppError::Unauthorized,
            403 => AppError::Forbidden,
            404 => AppError::NotFound("resource"),
            504 => AppError::Timeout(message),
            503 => AppError::ServiceUnavailable(message),
            _ => AppError::Internal,
        },
    }
}

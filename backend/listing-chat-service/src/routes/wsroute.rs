use crate::middleware::guards::User;
use crate::realtime::{RealtimeEvent, Subscription};
use crate::services::ChatService;
use crate::state::AppState;
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub conversation_id: Uuid,
}

/// Client to server frames
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsInboundEvent {
    MarkRead,
}

struct WsSession {
    conversation_id: Uuid,
    user_id: Uuid,
    chat: ChatService,
    subscription: Option<Subscription>,
    hb: Instant,
}

impl WsSession {
    fn new(conversation_id: Uuid, user_id: Uuid, chat: ChatService, subscription: Subscription) -> Self {
        Self {
            conversation_id,
            user_id,
            chat,
            subscription: Some(subscription),
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    conversation_id = %act.conversation_id,
                    user_id = %act.user_id,
                    "websocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            conversation_id = %self.conversation_id,
            user_id = %self.user_id,
            "websocket session started"
        );
        self.hb(ctx);
        // The context owns the subscription from here on; it is dropped, and
        // therefore unsubscribed, when the session stops.
        if let Some(subscription) = self.subscription.take() {
            ctx.add_stream(subscription);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            conversation_id = %self.conversation_id,
            user_id = %self.user_id,
            "websocket session stopped"
        );
    }
}

impl StreamHandler<RealtimeEvent> for WsSession {
    fn handle(&mut self, event: RealtimeEvent, ctx: &mut Self::Context) {
        match event.to_json() {
            Ok(json) => ctx.text(json),
            Err(e) => tracing::error!(error = %e, "failed to encode realtime event"),
        }
    }

    // Keep the socket open for client frames even if the feed ends.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<WsInboundEvent>(&text) {
                    Ok(WsInboundEvent::MarkRead) => {
                        let chat = self.chat.clone();
                        let user_id = self.user_id;
                        let conversation_id = self.conversation_id;
                        actix::spawn(async move {
                            if let Err(e) = chat.mark_read(user_id, conversation_id).await {
                                tracing::warn!(error = %e, "mark_read over websocket failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to parse websocket frame"),
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary websocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "websocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// GET /ws?conversation_id=
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: User,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let conversation_id = query.conversation_id;
    let subscription = state.chat.subscribe(user.id, conversation_id).await?;

    let session = WsSession::new(conversation_id, user.id, state.chat.clone(), subscription);
    ws::start(session, &req, stream)
}

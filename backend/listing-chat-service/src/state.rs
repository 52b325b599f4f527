use crate::{config::Config, redis_client::RedisClient, services::ChatService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub config: Arc<Config>,
    /// Present when the cross-instance relay is enabled
    pub redis: Option<RedisClient>,
}

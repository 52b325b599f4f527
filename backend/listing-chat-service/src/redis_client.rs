use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisResult};

/// Shared Redis handle: a reconnecting manager for commands plus the client
/// for connections that must not be shared (blocking reads).
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Fresh connection for `XREAD BLOCK`, which would stall the shared one
    pub async fn dedicated_connection(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

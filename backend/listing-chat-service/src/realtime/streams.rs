//! Cross-instance relay over Redis Streams.
//!
//! Every event is appended to one fan-out stream. Each instance runs a
//! listener on it and delivers what other instances published to its own
//! local subscribers. Delivery is at-least-once; consumers de-duplicate by
//! message id, and clients that missed the stream backfill from storage.

use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::events::{RealtimeEvent, RelayEnvelope};
use super::RealtimeSyncChannel;
use crate::error::{AppError, AppResult};
use crate::redis_client::RedisClient;

#[derive(Debug, Clone)]
pub struct StreamsConfig {
    /// Approximate cap on the fan-out stream
    pub fanout_maxlen: usize,
    pub batch_size: usize,
    pub block_ms: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            fanout_maxlen: 100_000,
            batch_size: 100,
            block_ms: 5_000,
        }
    }
}

pub fn fanout_stream_key() -> String {
    "stream:fanout:listing-conversations".to_string()
}

const TRIM_INTERVAL: u64 = 100;

/// Trim only every N publishes to keep XADD cheap. Clones of one relay share
/// the count.
#[derive(Debug, Clone)]
struct TrimSchedule {
    publishes: Arc<AtomicU64>,
    interval: u64,
}

impl TrimSchedule {
    fn new(interval: u64) -> Self {
        Self {
            publishes: Arc::new(AtomicU64::new(0)),
            interval: interval.max(1),
        }
    }

    /// Count one publish; true on the first and then every `interval`-th
    fn due(&self) -> bool {
        self.publishes.fetch_add(1, Ordering::Relaxed) % self.interval == 0
    }
}

#[derive(Clone)]
pub struct StreamRelay {
    redis: RedisClient,
    instance_id: Uuid,
    config: StreamsConfig,
    trim: TrimSchedule,
}

impl StreamRelay {
    pub fn new(redis: RedisClient, config: StreamsConfig) -> Self {
        Self {
            redis,
            instance_id: Uuid::new_v4(),
            config,
            trim: TrimSchedule::new(TRIM_INTERVAL),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn publish(&self, event: &RealtimeEvent) -> AppResult<String> {
        let envelope = RelayEnvelope {
            origin: self.instance_id,
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope).map_err(|e| {
            error!(error = %e, "failed to serialize relay envelope");
            AppError::Internal
        })?;
        let conversation_id = event.conversation_id().to_string();

        let mut conn = self.redis.connection();
        let entry_id: String = conn
            .xadd(
                fanout_stream_key(),
                "*",
                &[
                    ("conversation_id", conversation_id.as_str()),
                    ("payload", payload.as_str()),
                ],
            )
            .await?;

        if self.trim.due() {
            self.spawn_trim();
        }

        Ok(entry_id)
    }

    fn spawn_trim(&self) {
        let mut conn = self.redis.connection();
        let fanout_maxlen = self.config.fanout_maxlen;
        tokio::spawn(async move {
            if let Err(e) = conn
                .xtrim::<_, ()>(fanout_stream_key(), StreamMaxlen::Approx(fanout_maxlen))
                .await
            {
                warn!(error = %e, "failed to trim fanout stream");
            }
        });
    }

    /// Read the fan-out stream forever, reconnecting with backoff
    pub fn spawn_listener(&self, channel: RealtimeSyncChannel) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move { relay.listen(channel).await })
    }

    async fn listen(&self, channel: RealtimeSyncChannel) {
        let mut backoff = Backoff::default();
        // "$" on the first read: only events published after startup
        let mut last_id = "$".to_string();

        loop {
            let mut conn = match self.redis.dedicated_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "relay listener cannot connect to redis");
                    time::sleep(delay).await;
                    continue;
                }
            };
            info!(instance_id = %self.instance_id, "relay listener connected");
            backoff.reset();

            let options = StreamReadOptions::default()
                .block(self.config.block_ms)
                .count(self.config.batch_size);

            loop {
                let reply: redis::RedisResult<Option<StreamReadReply>> = conn
                    .xread_options(&[fanout_stream_key()], &[last_id.as_str()], &options)
                    .await;

                match reply {
                    Ok(Some(reply)) => {
                        for entry in reply.keys.into_iter().flat_map(|k| k.ids) {
                            self.deliver(&channel, entry.get::<String>("payload"));
                            last_id = entry.id;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let delay = backoff.next_delay();
                        error!(error = %e, ?delay, "relay listener read failed");
                        time::sleep(delay).await;
                        break;
                    }
                }
            }
        }
    }

    fn deliver(&self, channel: &RealtimeSyncChannel, payload: Option<String>) {
        let Some(payload) = payload else {
            warn!("fanout entry without payload");
            return;
        };
        match serde_json::from_str::<RelayEnvelope>(&payload) {
            Ok(envelope) if envelope.origin == self.instance_id => {}
            Ok(envelope) => {
                debug!(
                    conversation_id = %envelope.event.conversation_id(),
                    origin = %envelope.origin,
                    "relayed event delivered locally"
                );
                channel.deliver_local(&envelope.event);
            }
            Err(e) => warn!(error = %e, "undecodable relay envelope"),
        }
    }
}

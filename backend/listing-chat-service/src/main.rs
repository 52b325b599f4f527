use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use listing_chat_service::{
    config::{Config, KafkaConfig},
    db, logging,
    realtime::{streams::StreamsConfig, RealtimeSyncChannel, StreamRelay},
    redis_client::RedisClient,
    routes,
    services::{ChatService, LogSink, NotificationSink, Repositories},
    state::AppState,
};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::from_env().context("load configuration")?);
    logging::init_tracing(cfg.log_format);

    let repos = match &cfg.database_url {
        Some(url) => {
            let pool = db::init_pool(url, cfg.db_max_connections)
                .await
                .context("initialize database")?;
            Repositories::postgres(pool)
        }
        None => {
            let (repos, listings) = Repositories::in_memory();
            for seed in &cfg.seed_listings {
                listings.register(seed.listing_id, seed.owner_id).await;
            }
            if cfg.seed_listings.is_empty() {
                tracing::warn!(
                    "DATABASE_URL not set, using in-memory storage with no listings; \
                     set SEED_LISTINGS=listing_id:owner_id,... to open conversations"
                );
            } else {
                tracing::warn!(
                    listings = cfg.seed_listings.len(),
                    "DATABASE_URL not set, using in-memory storage with seeded listings"
                );
            }
            repos
        }
    };

    let redis = match &cfg.redis_url {
        Some(url) => Some(RedisClient::from_url(url).await.context("connect redis")?),
        None => None,
    };
    let realtime = match &redis {
        Some(redis) => {
            let relay = StreamRelay::new(redis.clone(), StreamsConfig::default());
            let channel = RealtimeSyncChannel::with_relay(relay.clone());
            relay.spawn_listener(channel.clone());
            tracing::info!(instance_id = %relay.instance_id(), "redis streams relay enabled");
            channel
        }
        None => RealtimeSyncChannel::new(),
    };

    let sink = notification_sink(cfg.kafka.as_ref())?;
    let chat = ChatService::new(repos, realtime, sink, cfg.limits);

    let state = AppState {
        chat,
        config: cfg.clone(),
        redis,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting listing-chat-service");

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("bind {bind_addr}"))?
    .run()
    .await
    .context("http server")?;

    Ok(())
}

#[cfg(feature = "kafka")]
fn notification_sink(kafka: Option<&KafkaConfig>) -> anyhow::Result<Arc<dyn NotificationSink>> {
    use listing_chat_service::services::KafkaNotificationSink;

    Ok(match kafka {
        Some(kafka) => Arc::new(
            KafkaNotificationSink::new(&kafka.brokers, &kafka.notification_topic)
                .context("create kafka sink")?,
        ),
        None => Arc::new(LogSink),
    })
}

#[cfg(not(feature = "kafka"))]
fn notification_sink(kafka: Option<&KafkaConfig>) -> anyhow::Result<Arc<dyn NotificationSink>> {
    if kafka.is_some() {
        tracing::warn!("KAFKA_BROKERS set but built without the `kafka` feature, logging notifications instead");
    }
    Ok(Arc::new(LogSink))
}

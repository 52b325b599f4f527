//! Kafka notification sink
//!
//! Each record is keyed by recipient so one user's notifications stay in
//! order on a single partition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::notification_dispatcher::{NotificationEvent, NotificationSink};
use crate::error::{AppError, AppResult};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire record consumed by the downstream push/email service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub record_id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: NotificationEvent,
}

impl NotificationRecord {
    pub fn new(event: &NotificationEvent, emitted_at: DateTime<Utc>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            emitted_at,
            event: event.clone(),
        }
    }
}

#[derive(Clone)]
pub struct KafkaNotificationSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotificationSink {
    pub fn new(brokers: &str, topic: &str) -> AppResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()
            .map_err(|e| AppError::Config(format!("kafka producer: {e}")))?;

        info!(%brokers, %topic, "kafka notification sink ready");
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    async fn emit(&self, event: &NotificationEvent) -> AppResult<()> {
        let record = NotificationRecord::new(event, Utc::now());
        let payload = serde_json::to_vec(&record).map_err(|e| {
            error!(error = %e, "notification record not serializable");
            AppError::Internal
        })?;
        let key = event.recipient_id().to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: "event",
            value: Some(event.name()),
        });

        let delivery = self
            .producer
            .send(
                FutureRecord::to(&self.topic)
                    .key(&key)
                    .payload(&payload)
                    .headers(headers),
                DELIVERY_TIMEOUT,
            )
            .await;

        match delivery {
            Ok((partition, offset)) => {
                debug!(
                    recipient_id = %event.recipient_id(),
                    event = event.name(),
                    partition,
                    offset,
                    "notification delivered to kafka"
                );
                Ok(())
            }
            Err((e, _)) => Err(AppError::ServiceUnavailable(format!("kafka: {e}"))),
        }
    }
}

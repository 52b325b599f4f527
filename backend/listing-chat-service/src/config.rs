use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;

/// Upper bound accepted for a single page of messages
pub const MAX_PAGE_LIMIT: i64 = 200;

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub notification_topic: String,
}

/// Listing registered with the in-memory listing directory at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSeed {
    pub listing_id: Uuid,
    pub owner_id: Uuid,
}

impl ListingSeed {
    /// Parse `listing_id:owner_id` pairs separated by commas
    fn parse_list(raw: &str) -> Result<Vec<Self>, AppError> {
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| -> Result<Self, AppError> {
                let (listing, owner) = pair.split_once(':').ok_or_else(|| {
                    AppError::Config(format!("SEED_LISTINGS entry is not listing:owner: {pair}"))
                })?;
                let parse = |id: &str| {
                    Uuid::parse_str(id.trim()).map_err(|_| {
                        AppError::Config(format!("SEED_LISTINGS has an invalid id: {id}"))
                    })
                };
                Ok(Self {
                    listing_id: parse(listing)?,
                    owner_id: parse(owner)?,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Limits enforced by the messaging engine itself
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    pub max_message_length: usize,
    pub default_page_limit: i64,
    pub send_timeout: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_message_length: 4000,
            default_page_limit: 50,
            send_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs the service on in-memory storage
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    /// Cross-instance relay over Redis Streams; disabled when unset
    pub redis_url: Option<String>,
    pub port: u16,
    pub kafka: Option<KafkaConfig>,
    pub limits: EngineLimits,
    pub log_format: LogFormat,
    /// Only used without `DATABASE_URL`; Postgres reads the `listings` table
    pub seed_listings: Vec<ListingSeed>,
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} is not a valid value: {raw}"))),
        _ => Ok(default),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let database_url = optional("DATABASE_URL");
        let redis_url = optional("REDIS_URL");
        let port = parsed("PORT", 8085u16)?;
        let db_max_connections = parsed("DB_MAX_CONNECTIONS", 16usize)?;
        if db_max_connections == 0 {
            return Err(AppError::Config("DB_MAX_CONNECTIONS must be positive".into()));
        }

        let kafka = optional("KAFKA_BROKERS").map(|brokers| KafkaConfig {
            brokers,
            notification_topic: optional("KAFKA_NOTIFICATION_TOPIC")
                .unwrap_or_else(|| "notifications".to_string()),
        });

        let defaults = EngineLimits::default();
        let send_timeout_secs = parsed("SEND_TIMEOUT_SECS", defaults.send_timeout.as_secs())?;
        let default_page_limit =
            parsed("MESSAGE_PAGE_LIMIT", defaults.default_page_limit)?.clamp(1, MAX_PAGE_LIMIT);
        let max_message_length = parsed("MAX_MESSAGE_LENGTH", defaults.max_message_length)?;
        if max_message_length == 0 {
            return Err(AppError::Config("MAX_MESSAGE_LENGTH must be positive".into()));
        }

        let seed_listings = optional("SEED_LISTINGS")
            .map(|raw| ListingSeed::parse_list(&raw))
            .transpose()?
            .unwrap_or_default();

        let log_format = optional("LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or(LogFormat::Pretty);

        Ok(Self {
            database_url,
            db_max_connections,
            redis_url,
            port,
            kafka,
            limits: EngineLimits {
                max_message_length,
                default_page_limit,
                send_timeout: Duration::from_secs(send_timeout_secs.max(1)),
            },
            log_format,
            seed_listings,
        })
    }
}

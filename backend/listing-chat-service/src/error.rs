use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    /// Validation failure (empty content, malformed identifiers, self-targeting).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No authenticated identity was supplied.
    #[error("unauthorized")]
    Unauthorized,

    /// Caller is authenticated but not a participant of the conversation.
    #[error("forbidden")]
    Forbidden,

    /// A block relation exists in either direction between sender and counterpart.
    #[error("messaging is blocked between these users")]
    Blocked,

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("database error: {0}")]
    Database(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal server error")]
    Internal,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::ServiceUnavailable(format!("db pool: {e}"))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::ServiceUnavailable(format!("redis: {e}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AppError::Timeout(e.to_string())
        } else {
            AppError::ServiceUnavailable(e.to_string())
        }
    }
}

impl AppError {
    /// Transient IO failures may be retried by the caller; everything else is final.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Database(_)
            | AppError::ServiceUnavailable(_)
            | AppError::Timeout(_)
            | AppError::Internal => ErrorKind::Retryable,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Stable machine-readable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => "internal",
            AppError::BadRequest(_) => "validation",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Blocked => "blocked",
            AppError::NotFound(_) => "not_found",
            AppError::Database(_) | AppError::ServiceUnavailable(_) => "unavailable",
            AppError::Timeout(_) => "timeout",
        }
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden | AppError::Blocked => 403,
            AppError::NotFound(_) => 404,
            AppError::Database(_) | AppError::ServiceUnavailable(_) => 503,
            AppError::Timeout(_) => 504,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => 500,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'a str,
    status: u16,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let status = AppError::status_code(self);
        if status >= 500 {
            tracing::error!(error = %self, "request failed");
        }
        // Internal details of storage failures are not echoed to clients.
        let message = match self {
            AppError::Database(_) => "storage temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        HttpResponse::build(ResponseError::status_code(self)).json(ErrorBody {
            error: message,
            code: self.code(),
            status,
        })
    }
}

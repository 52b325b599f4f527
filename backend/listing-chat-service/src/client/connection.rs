use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::guards::USER_ID_HEADER;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: Uuid,
    pub bearer_token: Option<String>,
}

impl Credentials {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            bearer_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn headers(&self) -> AppResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&self.user_id.to_string())
                .map_err(|e| AppError::BadRequest(format!("user id header: {e}")))?,
        );
        if let Some(token) = &self.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AppError::BadRequest(format!("authorization header: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

/// Everything a client operation needs to reach the service.
///
/// Passed explicitly into every call. A credential change produces a new
/// context with a bumped generation instead of mutating shared state.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    base_url: String,
    credentials: Credentials,
    http: reqwest::Client,
    request_timeout: Duration,
    generation: u64,
}

impl ConnectionContext {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        request_timeout: Duration,
    ) -> AppResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = build_http_client(&credentials, request_timeout)?;
        Ok(Self {
            base_url,
            credentials,
            http,
            request_timeout,
            generation: 0,
        })
    }

    /// Rebuild for new credentials; same inputs always give the same context
    pub fn with_credentials(&self, credentials: Credentials) -> AppResult<Self> {
        let http = build_http_client(&credentials, self.request_timeout)?;
        Ok(Self {
            base_url: self.base_url.clone(),
            credentials,
            http,
            request_timeout: self.request_timeout,
            generation: self.generation + 1,
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.credentials.user_id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `path` is relative to `/api/v1`
    pub fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn ws_url(&self, conversation_id: Uuid) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}/api/v1/ws?conversation_id={conversation_id}")
    }
}

fn build_http_client(credentials: &Credentials, timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .default_headers(credentials.headers()?)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Config(format!("http client: {e}")))
}

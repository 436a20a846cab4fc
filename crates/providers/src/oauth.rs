use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Tokens are treated as expired this many seconds before the provider says so.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 5 * 60;

/// Scope requested for document operations.
pub const DOCUMENTS_SCOPE: &str = "BoldSign.Documents.All";

/// Source of bearer tokens for provider API calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token that is valid for at least the safety margin.
    async fn valid_token(&self) -> Result<String, OAuthError>;

    /// Drops any cached token so the next call fetches a fresh one.
    async fn invalidate(&self);
}

/// Cached bearer token with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCache {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenCache {
    /// Returns `true` while `now` is before expiry minus the safety margin.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::seconds(EXPIRY_SAFETY_MARGIN_SECS)
    }
}

/// OAuth client-credentials flow with an in-memory [`TokenCache`].
pub struct ClientCredentialsTokenProvider {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: Mutex<Option<TokenCache>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            token_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: DOCUMENTS_SCOPE.to_string(),
            cache: Mutex::new(None),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    async fn request_token(&self) -> Result<TokenResponse, OAuthError> {
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        parse_json(response).await
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn valid_token(&self) -> Result<String, OAuthError> {
        // Held across the request so concurrent callers share one refresh.
        let mut cache = self.cache.lock().await;
        let now = (self.clock)();
        if let Some(cached) = cache.as_ref().filter(|cached| cached.is_fresh(now)) {
            return Ok(cached.token.clone());
        }

        let response = self.request_token().await?;
        debug!(stage = "providers", expires_in = response.expires_in, "fetched access token");
        let entry = TokenCache {
            token: response.access_token.clone(),
            expires_at: response.expires_at(now),
        };
        *cache = Some(entry);
        Ok(response.access_token)
    }

    async fn invalidate(&self) {
        self.cache.lock().await.take();
    }
}

/// Fixed token, for pre-issued API keys and tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn valid_token(&self) -> Result<String, OAuthError> {
        Ok(self.token.clone())
    }

    async fn invalidate(&self) {}
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Computes the expiration timestamp relative to the provided instant.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in as i64)
    }
}

/// Errors that can occur during OAuth interactions.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, OAuthError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(OAuthError::Status { status, body });
    }

    Ok(response.json().await?)
}

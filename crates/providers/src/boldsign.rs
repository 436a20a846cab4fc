use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::oauth::{OAuthError, TokenProvider};

/// Client for the BoldSign document API.
#[derive(Clone)]
pub struct BoldSignClient {
    http: Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl BoldSignClient {
    pub fn new(base_url: Url, tokens: Arc<dyn TokenProvider>, http: Client) -> Self {
        Self {
            http,
            base_url,
            tokens,
        }
    }

    /// Fetches the provider's view of a document.
    pub async fn document_properties(
        &self,
        document_id: &str,
    ) -> Result<DocumentProperties, ProviderError> {
        let mut url = self.base_url.join("v1/document/properties")?;
        url.query_pairs_mut().append_pair("documentId", document_id);

        let response = self.get_authorized(url).await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Downloads the signed PDF of a completed document.
    pub async fn download_signed_pdf(&self, document_id: &str) -> Result<Vec<u8>, ProviderError> {
        let mut url = self.base_url.join("v1/document/download")?;
        url.query_pairs_mut().append_pair("documentId", document_id);

        let response = self.get_authorized(url).await?;
        let response = ensure_success(response).await?;
        let bytes = response.bytes().await?;
        debug!(stage = "providers", document_id, size = bytes.len(), "downloaded signed pdf");
        Ok(bytes.to_vec())
    }

    /// Sends a GET with a bearer token. A `401` drops the cached token and
    /// the request is repeated once with a fresh one.
    async fn get_authorized(&self, url: Url) -> Result<Response, ProviderError> {
        let token = self.tokens.valid_token().await?;
        let response = self.http.get(url.clone()).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(stage = "providers", "access token rejected; refreshing");
        self.tokens.invalidate().await;
        let token = self.tokens.valid_token().await?;
        Ok(self.http.get(url).bearer_auth(&token).send().await?)
    }
}

/// Subset of the document properties response used by the service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentProperties {
    pub document_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message_title: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub completed_date: Option<i64>,
}

impl DocumentProperties {
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_date
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

/// Errors produced by the BoldSign client.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token error: {0}")]
    Token(#[from] OAuthError),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(ProviderError::Status { status, body });
    }
    Ok(response)
}

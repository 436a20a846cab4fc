use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Fully rendered email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Delivery backend for outbound email.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Sends one message and returns the provider's message id.
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError>;
}

/// Delivery failure as reported by the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmailError {
    /// Provider answered with a non-success status.
    #[error("email provider returned {status}: {message}")]
    Status { status: u16, message: String },
    /// Request never produced a response.
    #[error("email request failed: {0}")]
    Network(String),
    /// Request could not be built from the configured endpoint.
    #[error("invalid email request: {0}")]
    InvalidRequest(String),
}

/// [`EmailTransport`] backed by the Resend HTTP API.
#[derive(Clone)]
pub struct ResendTransport {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl ResendTransport {
    pub fn new(base_url: Url, api_key: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
        }
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
struct SendEmailResponse {
    id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[async_trait]
impl EmailTransport for ResendTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError> {
        let url = self
            .base_url
            .join("emails")
            .map_err(|err| EmailError::InvalidRequest(err.to_string()))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&SendEmailRequest {
                from: &message.from,
                to: [&message.to],
                subject: &message.subject,
                html: &message.html,
            })
            .send()
            .await
            .map_err(|err| {
                if err.is_builder() {
                    EmailError::InvalidRequest(err.to_string())
                } else {
                    EmailError::Network(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|parsed| parsed.message)
                .unwrap_or(body);
            return Err(EmailError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SendEmailResponse = response
            .json()
            .await
            .map_err(|err| EmailError::Network(err.to_string()))?;
        Ok(parsed.id)
    }
}

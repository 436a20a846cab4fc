use std::{sync::Arc, time::Duration};

use htmlescape::encode_minimal;
use metrics::counter;
use tracing::{info, warn};
use url::Url;

use esign_core::types::NotificationKind;
use esign_providers::{EmailError, EmailMessage, EmailTransport};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Result of a delivery attempt sequence. Failures are reported here, never
/// raised to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailDelivery {
    pub success: bool,
    pub message_id: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Wait after the failed `attempt` (1-based): `base * 2^(attempt - 1)`,
    /// capped at `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// 408, 429 and 5xx are retried; other statuses are final.
    pub fn should_retry_status(status: u16) -> bool {
        matches!(status, 408 | 429 | 500..=599)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30))
    }
}

/// Retryable statuses, timeouts and network failures are worth retrying.
pub fn is_transient(error: &EmailError) -> bool {
    match error {
        EmailError::Network(_) => true,
        EmailError::InvalidRequest(_) => false,
        EmailError::Status { status, message } => {
            let message = message.to_ascii_lowercase();
            RetryPolicy::should_retry_status(*status)
                || message.contains("timeout")
                || message.contains("temporarily")
        }
    }
}

/// Builds links into the agent-facing web app.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    base: Url,
}

impl LinkBuilder {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    /// Transaction page when the document belongs to one, the document
    /// library otherwise.
    pub fn document_link(&self, transaction_id: Option<&str>) -> String {
        let path = match transaction_id {
            Some(id) => format!("transactions/{id}"),
            None => "documents".to_string(),
        };
        self.join(&path)
    }

    /// Call-to-action for re-sending an expired document.
    pub fn resend_link(&self, transaction_id: Option<&str>, signature_document_id: &str) -> String {
        format!(
            "{}?resend={signature_document_id}",
            self.document_link(transaction_id)
        )
    }

    fn join(&self, path: &str) -> String {
        self.base
            .join(path)
            .map(String::from)
            .unwrap_or_else(|_| format!("{}{path}", self.base))
    }
}

/// Values substituted into a notification template.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub agent_name: &'a str,
    pub document_title: &'a str,
    pub link: &'a str,
    pub reason: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

pub struct EmailTemplate;

impl EmailTemplate {
    pub fn render(kind: NotificationKind, ctx: &TemplateContext<'_>) -> RenderedEmail {
        let title = encode_minimal(ctx.document_title);
        let name = encode_minimal(ctx.agent_name);
        let link = encode_minimal(ctx.link);

        let (subject, lead, action) = match kind {
            NotificationKind::Sent => (
                format!("\"{}\" was sent for signature", ctx.document_title),
                format!("<p><strong>{title}</strong> has been sent to all signers.</p>"),
                "View document",
            ),
            NotificationKind::Completed => (
                format!("\"{}\" is fully signed", ctx.document_title),
                format!(
                    "<p>All parties have signed <strong>{title}</strong>. The signed copy is ready.</p>"
                ),
                "Download signed document",
            ),
            NotificationKind::Declined => {
                let reason = ctx
                    .reason
                    .map(|reason| format!("<p>Reason given: {}</p>", encode_minimal(reason)))
                    .unwrap_or_default();
                (
                    format!("\"{}\" was declined", ctx.document_title),
                    format!(
                        "<p>A signer declined <strong>{title}</strong>. Your send credit has been refunded.</p>{reason}"
                    ),
                    "Review document",
                )
            }
            NotificationKind::Expired => (
                format!("\"{}\" expired before it was signed", ctx.document_title),
                format!("<p><strong>{title}</strong> expired before all signers completed it.</p>"),
                "Resend document",
            ),
        };

        let html = format!("<p>Hi {name},</p>{lead}<p><a href=\"{link}\">{action}</a></p>");
        RenderedEmail { subject, html }
    }
}

/// Per-document values needed to address and render a notification.
#[derive(Debug, Clone)]
pub struct Notification<'a> {
    pub kind: NotificationKind,
    pub recipient: &'a str,
    pub template: TemplateContext<'a>,
}

/// Sends transactional emails through an [`EmailTransport`] with bounded retries.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn EmailTransport>,
    from: String,
    links: LinkBuilder,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn EmailTransport>,
        from: impl Into<String>,
        links: LinkBuilder,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            from: from.into(),
            links,
            retry,
        }
    }

    pub fn links(&self) -> &LinkBuilder {
        &self.links
    }

    /// Renders and delivers one notification.
    pub async fn notify(&self, notification: &Notification<'_>) -> EmailDelivery {
        let rendered = EmailTemplate::render(notification.kind, &notification.template);
        let message = EmailMessage {
            from: self.from.clone(),
            to: notification.recipient.to_string(),
            subject: rendered.subject,
            html: rendered.html,
        };

        let delivery = self.send_email_with_retry(&message, DEFAULT_MAX_ATTEMPTS).await;
        let outcome = if delivery.success { "sent" } else { "failed" };
        counter!(
            "email_delivery_total",
            "template" => notification.kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        delivery
    }

    /// Attempts delivery up to `max_attempts` times. Transient failures wait
    /// [`RetryPolicy::next_delay`] before the next attempt; permanent failures
    /// stop immediately.
    pub async fn send_email_with_retry(
        &self,
        message: &EmailMessage,
        max_attempts: u32,
    ) -> EmailDelivery {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.transport.send(message).await {
                Ok(message_id) => {
                    info!(
                        stage = "notify",
                        attempt,
                        %message_id,
                        subject = %message.subject,
                        "email delivered"
                    );
                    return EmailDelivery {
                        success: true,
                        message_id: Some(message_id),
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(err) => {
                    let transient = is_transient(&err);
                    if !transient || attempt >= max_attempts {
                        warn!(
                            stage = "notify",
                            attempt,
                            transient,
                            error = %err,
                            "email delivery failed"
                        );
                        return EmailDelivery {
                            success: false,
                            message_id: None,
                            attempts: attempt,
                            error: Some(err.to_string()),
                        };
                    }

                    let delay = self.retry.next_delay(attempt);
                    warn!(
                        stage = "notify",
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient email failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Outer JSON shape of a provider webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WebhookEnvelope {
    /// Parses the raw request body.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Provider-supplied event id, ignoring blank values.
    pub fn event_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Document id carried by the payload, when present.
    pub fn document_id(&self) -> Option<&str> {
        self.data
            .get("documentId")
            .or_else(|| self.data.get("document_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Provider test deliveries are acknowledged without touching state.
    pub fn is_test_event(&self) -> bool {
        self.event == "webhook.test"
            || self
                .data
                .get("environment")
                .and_then(Value::as_str)
                .is_some_and(|env| env.eq_ignore_ascii_case("test"))
    }
}

/// Errors that can occur while decoding a webhook payload into a [`ProviderEvent`].
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("failed to parse event data: {0}")]
    Json(#[from] serde_json::Error),
}

/// Provider notification decoded into a strongly typed variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    DocumentSent {
        document_id: String,
    },
    SignerCompleted {
        document_id: String,
        signer_email: Option<String>,
    },
    SignerViewed {
        document_id: String,
        signer_email: Option<String>,
    },
    SignerDeclined {
        document_id: String,
        signer_email: Option<String>,
        reason: Option<String>,
    },
    DocumentCompleted {
        document_id: String,
        completed_at: Option<DateTime<Utc>>,
    },
    DocumentDeclined {
        document_id: String,
        reason: Option<String>,
    },
    DocumentExpired {
        document_id: String,
    },
    DocumentRevoked {
        document_id: String,
        reason: Option<String>,
    },
    Unknown {
        event_type: String,
        document_id: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventData {
    #[serde(default, alias = "document_id")]
    document_id: Option<String>,
    #[serde(default, alias = "signer_email")]
    signer_email: Option<String>,
    #[serde(default, alias = "decline_reason", alias = "declineReason")]
    reason: Option<String>,
    #[serde(default, alias = "revoke_reason", alias = "revokeReason")]
    revoked_reason: Option<String>,
    #[serde(default, alias = "completed_at")]
    completed_at: Option<Value>,
}

impl ProviderEvent {
    /// Decodes the envelope once at the boundary. Unrecognised event types
    /// decode to [`ProviderEvent::Unknown`] instead of failing.
    pub fn decode(envelope: &WebhookEnvelope) -> Result<Self, EventDecodeError> {
        let data: EventData = match &envelope.data {
            Value::Null => EventData::default(),
            other => serde_json::from_value(other.clone())?,
        };

        let known = matches!(
            envelope.event.as_str(),
            "document.sent"
                | "signer.completed"
                | "signer.signed"
                | "signer.viewed"
                | "signer.declined"
                | "document.completed"
                | "document.declined"
                | "document.expired"
                | "document.revoked"
        );
        if !known {
            return Ok(Self::Unknown {
                event_type: envelope.event.clone(),
                document_id: data.document_id,
            });
        }

        let document_id = data
            .document_id
            .filter(|id| !id.is_empty())
            .ok_or(EventDecodeError::MissingField("data.documentId"))?;

        let event = match envelope.event.as_str() {
            "document.sent" => Self::DocumentSent { document_id },
            "signer.completed" | "signer.signed" => Self::SignerCompleted {
                document_id,
                signer_email: data.signer_email,
            },
            "signer.viewed" => Self::SignerViewed {
                document_id,
                signer_email: data.signer_email,
            },
            "signer.declined" => Self::SignerDeclined {
                document_id,
                signer_email: data.signer_email,
                reason: data.reason,
            },
            "document.completed" => Self::DocumentCompleted {
                document_id,
                completed_at: data
                    .completed_at
                    .as_ref()
                    .and_then(|raw| lenient_timestamp("completedAt", raw)),
            },
            "document.declined" => Self::DocumentDeclined {
                document_id,
                reason: data.reason,
            },
            "document.expired" => Self::DocumentExpired { document_id },
            _ => Self::DocumentRevoked {
                document_id,
                reason: data.revoked_reason.or(data.reason),
            },
        };

        Ok(event)
    }

    /// Provider document id the event refers to.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::DocumentSent { document_id }
            | Self::SignerCompleted { document_id, .. }
            | Self::SignerViewed { document_id, .. }
            | Self::SignerDeclined { document_id, .. }
            | Self::DocumentCompleted { document_id, .. }
            | Self::DocumentDeclined { document_id, .. }
            | Self::DocumentExpired { document_id }
            | Self::DocumentRevoked { document_id, .. } => Some(document_id),
            Self::Unknown { document_id, .. } => document_id.as_deref(),
        }
    }

    /// Label used for logging and metrics; bounded cardinality.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::DocumentSent { .. } => "document.sent",
            Self::SignerCompleted { .. } => "signer.completed",
            Self::SignerViewed { .. } => "signer.viewed",
            Self::SignerDeclined { .. } => "signer.declined",
            Self::DocumentCompleted { .. } => "document.completed",
            Self::DocumentDeclined { .. } => "document.declined",
            Self::DocumentExpired { .. } => "document.expired",
            Self::DocumentRevoked { .. } => "document.revoked",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Signer-level events are recorded but never change document state.
    pub fn is_signer_informational(&self) -> bool {
        matches!(self, Self::SignerViewed { .. } | Self::SignerDeclined { .. })
    }
}

/// Accepts RFC 3339 strings and unix seconds. Anything else is dropped so
/// the caller falls back to its own notion of the time.
fn lenient_timestamp(field: &'static str, raw: &Value) -> Option<DateTime<Utc>> {
    let parsed = match raw {
        Value::Null => return None,
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    };
    if parsed.is_none() {
        warn!(stage = "decode", field, value = %raw, "ignoring unparseable timestamp");
    }
    parsed
}

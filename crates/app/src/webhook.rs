use std::{borrow::Cow, time::Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use esign_core::events::{ProviderEvent, WebhookEnvelope};
use esign_core::signature::verify_signature;
use esign_storage::{NewWebhookEvent, NewWebhookMetric, StoreOutcome};
use esign_util::WebhookVerification;

use crate::router::AppState;

pub const HEADER_SIGNATURE: &str = "X-BoldSign-Signature";

/// Ingests one BoldSign webhook delivery: verify, persist, dedupe, apply,
/// then mark processed.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    let start = Instant::now();
    let insecure = authenticate(&state, &headers, &body)?;

    let trimmed = body.trim_ascii();
    if trimmed.is_empty() || trimmed == b"{}" {
        info!(stage = "ingress", "connectivity check acknowledged");
        return Ok(received(None));
    }

    let envelope = match WebhookEnvelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(err) if insecure => {
            warn!(
                stage = "ingress",
                error = %err,
                "unparseable payload accepted during insecure bootstrap"
            );
            return Ok(received(None));
        }
        Err(err) => {
            warn!(stage = "ingress", error = %err, "rejecting unparseable payload");
            return Err(WebhookError::BadRequest(format!("invalid JSON payload: {err}")));
        }
    };

    if envelope.is_test_event() {
        info!(stage = "ingress", event = %envelope.event, "test event acknowledged");
        return Ok(received(Some("test event acknowledged")));
    }

    let payload_json = String::from_utf8_lossy(&body);
    let record = NewWebhookEvent {
        event_id: Cow::Borrowed(""),
        event_type: Cow::Borrowed(envelope.event.as_str()),
        document_id: envelope.document_id().map(Cow::Borrowed),
        payload_json,
        received_at: state.now(),
    }
    .with_event_id(envelope.event_id());
    let event_id = record.event_id.to_string();

    let events = state.storage().webhook_events();
    match events.store_event(record).await {
        Ok(StoreOutcome::Inserted) => {}
        Ok(StoreOutcome::AlreadyStored) => {
            info!(stage = "ingress", %event_id, "event redelivered");
        }
        Err(err) => {
            error!(stage = "ingress", %event_id, error = %err, "failed to persist webhook event");
            return Err(WebhookError::Internal);
        }
    }

    let processed = events.is_processed(&event_id).await.map_err(|err| {
        error!(stage = "ingress", %event_id, error = %err, "failed to read processed flag");
        WebhookError::Internal
    })?;
    if processed {
        counter!("webhook_duplicate_total").increment(1);
        info!(stage = "ingress", %event_id, "event already processed; skipping");
        return Ok(received(Some("Event already processed")));
    }

    let event = ProviderEvent::decode(&envelope).map_err(|err| {
        warn!(
            stage = "ingress",
            %event_id,
            event = %envelope.event,
            error = %err,
            "failed to decode event"
        );
        WebhookError::BadRequest(err.to_string())
    })?;
    let label = event.metric_label();
    counter!("webhook_ingress_total", "event" => label).increment(1);

    let outcome = match state.lifecycle().apply(&event).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(
                stage = "lifecycle",
                %event_id,
                event = label,
                error = %err,
                "failed to apply event"
            );
            histogram!("webhook_processing_seconds", "event" => label)
                .record(start.elapsed().as_secs_f64());
            return Err(WebhookError::Internal);
        }
    };

    let now = state.now();
    events.mark_processed(&event_id, now).await.map_err(|err| {
        error!(stage = "ingress", %event_id, error = %err, "failed to mark event processed");
        WebhookError::Internal
    })?;

    let elapsed = start.elapsed();
    histogram!("webhook_processing_seconds", "event" => label).record(elapsed.as_secs_f64());
    if let Err(err) = state
        .storage()
        .webhook_metrics()
        .record(&NewWebhookMetric {
            event_id: &event_id,
            event_type: label,
            outcome: outcome.as_str(),
            duration_ms: elapsed.as_millis() as i64,
            recorded_at: now,
        })
        .await
    {
        warn!(stage = "ingress", %event_id, error = %err, "failed to record webhook metric");
    }

    info!(
        stage = "ingress",
        %event_id,
        event = label,
        outcome = outcome.as_str(),
        elapsed_ms = elapsed.as_millis() as u64,
        "webhook processed"
    );
    Ok(received(None))
}

/// Answers CORS preflight requests for the webhook endpoint.
pub async fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, x-boldsign-signature"),
    );
    response
}

/// Returns `true` when the request was let through without verification.
fn authenticate(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<bool, WebhookError> {
    let secret = match state.webhook_auth() {
        WebhookVerification::Secret(secret) => secret,
        WebhookVerification::InsecureBootstrap => {
            warn!(
                stage = "ingress",
                "webhook signature verification is disabled (insecure bootstrap)"
            );
            return Ok(true);
        }
    };

    let Some(provided) = headers
        .get(HEADER_SIGNATURE)
        .and_then(|value| value.to_str().ok())
    else {
        counter!("webhook_invalid_signature_total").increment(1);
        warn!(stage = "ingress", "missing webhook signature");
        return Err(WebhookError::Unauthorized("missing signature"));
    };

    match verify_signature(body, provided, secret.as_bytes()) {
        Ok(true) => Ok(false),
        Ok(false) | Err(_) => {
            counter!("webhook_invalid_signature_total").increment(1);
            warn!(stage = "ingress", "invalid webhook signature");
            Err(WebhookError::Unauthorized("invalid signature"))
        }
    }
}

fn received(message: Option<&str>) -> Response {
    let body = match message {
        Some(message) => json!({ "received": true, "message": message }),
        None => json!({ "received": true }),
    };
    with_cors(Json(body).into_response())
}

fn with_cors(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Failure responses of the webhook endpoint, rendered as `{"error": ...}`.
#[derive(Debug)]
pub enum WebhookError {
    Unauthorized(&'static str),
    BadRequest(String),
    Internal,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message.to_string()),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error while processing webhook".to_string(),
            ),
        };
        let body: Value = json!({ "error": message });
        with_cors((status, Json(body)).into_response())
    }
}

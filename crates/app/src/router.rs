use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use esign_storage::Database;
use esign_util::WebhookVerification;

use crate::lifecycle::LifecycleExecutor;
use crate::problem::ProblemResponse;
use crate::{telemetry, webhook};

const DEFAULT_UNPROCESSED_LIMIT: u32 = 50;
const MAX_UNPROCESSED_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_auth: WebhookVerification,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    lifecycle: LifecycleExecutor,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_auth: WebhookVerification,
        lifecycle: LifecycleExecutor,
    ) -> Self {
        Self {
            metrics,
            storage,
            webhook_auth,
            clock: Arc::new(Utc::now),
            lifecycle,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_auth(&self) -> &WebhookVerification {
        &self.webhook_auth
    }

    pub fn lifecycle(&self) -> &LifecycleExecutor {
        &self.lifecycle
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/webhooks/boldsign",
            post(webhook::handle).options(webhook::preflight),
        )
        .route("/_debug/webhook-events/unprocessed", get(unprocessed_events))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        telemetry::render_metrics(state.metrics()),
    )
}

#[derive(Debug, Deserialize)]
struct UnprocessedQuery {
    #[serde(default)]
    limit: Option<u32>,
}

/// Stored events that never reached `processed`, oldest first.
async fn unprocessed_events(
    State(state): State<AppState>,
    Query(query): Query<UnprocessedQuery>,
) -> Result<Response, ProblemResponse> {
    let limit = match query.limit {
        None => DEFAULT_UNPROCESSED_LIMIT,
        Some(limit) if (1..=MAX_UNPROCESSED_LIMIT).contains(&limit) => limit,
        Some(limit) => {
            return Err(ProblemResponse::bad_request(
                "invalid_limit",
                format!("limit must be between 1 and {MAX_UNPROCESSED_LIMIT}, got {limit}"),
            ))
        }
    };

    let events = state
        .storage()
        .webhook_events()
        .list_unprocessed(limit)
        .await
        .map_err(|err| {
            error!(stage = "ingress", error = %err, "failed to list unprocessed events");
            ProblemResponse::internal("storage_error", "failed to list unprocessed events")
        })?;

    Ok(Json(json!({ "count": events.len(), "events": events })).into_response())
}

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::{is_unique_violation, to_rfc3339};

/// Repository responsible for the `webhook_events` table, the idempotency ledger.
#[derive(Clone)]
pub struct WebhookEventRepository {
    pool: SqlitePool,
}

impl WebhookEventRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists the raw event. A redelivery of an already stored id leaves the
    /// original row untouched.
    pub async fn store_event(
        &self,
        record: NewWebhookEvent<'_>,
    ) -> Result<StoreOutcome, WebhookEventError> {
        let result = sqlx::query(
            "INSERT INTO webhook_events \
             (event_id, event_type, document_id, payload_json, processed, received_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(&record.document_id)
        .bind(&record.payload_json)
        .bind(to_rfc3339(record.received_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(StoreOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(StoreOutcome::AlreadyStored),
            Err(err) => Err(WebhookEventError::Database(err)),
        }
    }

    /// Returns `true` once every side effect of the event has been applied.
    pub async fn is_processed(&self, event_id: &str) -> Result<bool, WebhookEventError> {
        let processed: Option<i64> =
            sqlx::query_scalar("SELECT processed FROM webhook_events WHERE event_id = ?")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(processed.unwrap_or(0) != 0)
    }

    /// Flags the event as applied.
    pub async fn mark_processed(
        &self,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), WebhookEventError> {
        let result = sqlx::query(
            "UPDATE webhook_events SET processed = 1, processed_at = ? WHERE event_id = ?",
        )
        .bind(to_rfc3339(processed_at))
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookEventError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    /// Loads a single stored event.
    pub async fn fetch(
        &self,
        event_id: &str,
    ) -> Result<Option<StoredWebhookEvent>, WebhookEventError> {
        let row = sqlx::query_as::<_, StoredWebhookEvent>(
            "SELECT event_id, event_type, document_id, payload_json, processed, processed_at, received_at \
             FROM webhook_events WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Oldest events that were stored but never marked processed, for manual
    /// reconciliation.
    pub async fn list_unprocessed(
        &self,
        limit: u32,
    ) -> Result<Vec<StoredWebhookEvent>, WebhookEventError> {
        let rows = sqlx::query_as::<_, StoredWebhookEvent>(
            "SELECT event_id, event_type, document_id, payload_json, processed, processed_at, received_at \
             FROM webhook_events \
             WHERE processed = 0 \
             ORDER BY received_at ASC \
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Result of attempting to insert into `webhook_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    AlreadyStored,
}

/// Data required to create a new entry in `webhook_events`.
#[derive(Clone)]
pub struct NewWebhookEvent<'a> {
    pub event_id: Cow<'a, str>,
    pub event_type: Cow<'a, str>,
    pub document_id: Option<Cow<'a, str>>,
    pub payload_json: Cow<'a, str>,
    pub received_at: DateTime<Utc>,
}

impl<'a> NewWebhookEvent<'a> {
    /// Uses the provider id when present, otherwise synthesizes
    /// `{event_type}_{unix_millis}_{random}`.
    pub fn with_event_id(self, provider_id: Option<&'a str>) -> Self {
        let event_id = match provider_id {
            Some(id) => Cow::Borrowed(id),
            None => Cow::Owned(synthesize_event_id(&self.event_type, self.received_at)),
        };
        Self { event_id, ..self }
    }
}

fn synthesize_event_id(event_type: &str, received_at: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{event_type}_{}_{}",
        received_at.timestamp_millis(),
        &random[..9]
    )
}

/// Row stored in `webhook_events`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredWebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub document_id: Option<String>,
    pub payload_json: String,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Error type for operations on the `webhook_events` repository.
#[derive(Debug, Error)]
pub enum WebhookEventError {
    #[error("webhook event {0} is not stored")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Write-only observability records in `webhook_metrics`.
#[derive(Clone)]
pub struct WebhookMetricRepository {
    pool: SqlitePool,
}

impl WebhookMetricRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, metric: &NewWebhookMetric<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO webhook_metrics (id, event_id, event_type, outcome, duration_ms, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(metric.event_id)
        .bind(metric.event_type)
        .bind(metric.outcome)
        .bind(metric.duration_ms)
        .bind(to_rfc3339(metric.recorded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// One processed event's duration and outcome.
pub struct NewWebhookMetric<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub outcome: &'a str,
    pub duration_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_now, setup_db};

    fn record(event_id: &str) -> NewWebhookEvent<'_> {
        NewWebhookEvent {
            event_id: Cow::Borrowed(event_id),
            event_type: Cow::Borrowed("document.sent"),
            document_id: Some(Cow::Borrowed("d1")),
            payload_json: Cow::Borrowed(r#"{"event":"document.sent"}"#),
            received_at: fixed_now(),
        }
    }

    #[tokio::test]
    async fn store_reports_existing_rows() {
        let db = setup_db().await;
        let repo = db.webhook_events();

        let outcome = repo.store_event(record("evt-1")).await.expect("insert");
        assert_eq!(outcome, StoreOutcome::Inserted);
        let outcome = repo.store_event(record("evt-1")).await.expect("redelivery");
        assert_eq!(outcome, StoreOutcome::AlreadyStored);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_events")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn processed_flag_lifecycle() {
        let db = setup_db().await;
        let repo = db.webhook_events();

        assert!(!repo.is_processed("missing").await.expect("lookup"));
        repo.store_event(record("evt-2")).await.expect("insert");
        assert!(!repo.is_processed("evt-2").await.expect("lookup"));

        repo.mark_processed("evt-2", fixed_now()).await.expect("mark");
        assert!(repo.is_processed("evt-2").await.expect("lookup"));

        let stored = repo.fetch("evt-2").await.expect("fetch").expect("row");
        assert!(stored.processed);
        assert_eq!(stored.processed_at, Some(fixed_now()));
    }

    #[tokio::test]
    async fn mark_processed_requires_stored_event() {
        let db = setup_db().await;
        let err = db
            .webhook_events()
            .mark_processed("ghost", fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookEventError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn lists_only_unprocessed_events() {
        let db = setup_db().await;
        let repo = db.webhook_events();
        repo.store_event(record("evt-a")).await.expect("insert");
        repo.store_event(record("evt-b")).await.expect("insert");
        repo.mark_processed("evt-a", fixed_now()).await.expect("mark");

        let pending = repo.list_unprocessed(10).await.expect("list");
        let ids: Vec<_> = pending.iter().map(|event| event.event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt-b"]);
    }

    #[test]
    fn synthesizes_ids_when_provider_omits_them() {
        let event = record("placeholder").with_event_id(None);
        let parts: Vec<_> = event.event_id.split('_').collect();
        assert_eq!(parts[0], "document.sent");
        assert_eq!(parts[1], fixed_now().timestamp_millis().to_string());
        assert_eq!(parts[2].len(), 9);

        let other = record("placeholder").with_event_id(None);
        assert_ne!(event.event_id, other.event_id);

        let provided = record("placeholder").with_event_id(Some("evt-9"));
        assert_eq!(provided.event_id, "evt-9");
    }

    #[tokio::test]
    async fn records_metrics() {
        let db = setup_db().await;
        db.webhook_metrics()
            .record(&NewWebhookMetric {
                event_id: "evt-1",
                event_type: "document.sent",
                outcome: "processed",
                duration_ms: 12,
                recorded_at: fixed_now(),
            })
            .await
            .expect("record");

        let outcome: String = sqlx::query_scalar("SELECT outcome FROM webhook_metrics")
            .fetch_one(db.pool())
            .await
            .expect("metric row");
        assert_eq!(outcome, "processed");
    }
}

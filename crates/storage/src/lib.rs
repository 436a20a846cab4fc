mod documents;
mod events;
mod ledger;

use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

pub use documents::{
    Agent, AgentRepository, DocumentRecord, DocumentRecordRepository, NewAgent,
    NewDocumentRecord, NewSignatureDocument, SignatureDocument, SignatureDocumentError,
    SignatureDocumentRepository, StatusChange,
};
pub use events::{
    NewWebhookEvent, NewWebhookMetric, StoreOutcome, StoredWebhookEvent, WebhookEventError,
    WebhookEventRepository, WebhookMetricRepository,
};
pub use ledger::{
    AppendOutcome, CreditLedgerError, CreditLedgerRepository, LedgerEntry, NewLedgerEntry,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the webhook event store.
    pub fn webhook_events(&self) -> WebhookEventRepository {
        WebhookEventRepository::new(self.pool.clone())
    }

    /// Returns a handle for recording per-event processing metrics.
    pub fn webhook_metrics(&self) -> WebhookMetricRepository {
        WebhookMetricRepository::new(self.pool.clone())
    }

    /// Returns a handle for documents sent for e-signature.
    pub fn signature_documents(&self) -> SignatureDocumentRepository {
        SignatureDocumentRepository::new(self.pool.clone())
    }

    /// Returns a handle for the agent's document library.
    pub fn documents(&self) -> DocumentRecordRepository {
        DocumentRecordRepository::new(self.pool.clone())
    }

    /// Returns a handle for agent profiles.
    pub fn agents(&self) -> AgentRepository {
        AgentRepository::new(self.pool.clone())
    }

    /// Returns a handle for the append-only credit ledger.
    pub fn credit_ledger(&self) -> CreditLedgerRepository {
        CreditLedgerRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// SQLITE_CONSTRAINT_UNIQUE (2067) or SQLITE_CONSTRAINT_PRIMARYKEY (1555).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code(),
            Some(code) if code == Cow::Borrowed("2067") || code == Cow::Borrowed("1555")
        ),
        _ => false,
    }
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply() {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 6, "expected core tables to be created");
    }

    #[tokio::test]
    async fn file_backed_database_persists_across_connections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("esign.db").display());

        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db.webhook_events()
            .store_event(NewWebhookEvent {
                event_id: Cow::Borrowed("evt-file"),
                event_type: Cow::Borrowed("document.sent"),
                document_id: None,
                payload_json: Cow::Borrowed("{}"),
                received_at: Utc::now(),
            })
            .await
            .expect("store");
        db.pool().close().await;

        let reopened = Database::connect(&url).await.expect("reconnect");
        reopened.run_migrations().await.expect("migrations are idempotent");
        let stored = reopened
            .webhook_events()
            .fetch("evt-file")
            .await
            .expect("fetch");
        assert!(stored.is_some());
    }
}

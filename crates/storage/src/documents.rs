use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use esign_core::types::{DocumentStatus, UnknownVariant};

use crate::to_rfc3339;

/// Agent profile; owner of documents and the credit ledger.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Agent {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

pub struct NewAgent<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub display_name: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Repository used to look up agents.
#[derive(Clone)]
pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, agent_id: &str) -> Result<Option<Agent>, sqlx::Error> {
        sqlx::query_as::<_, Agent>("SELECT id, email, display_name FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn insert(&self, agent: &NewAgent<'_>) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO agents (id, email, display_name, created_at) VALUES (?, ?, ?, ?)")
            .bind(agent.id)
            .bind(agent.email)
            .bind(agent.display_name)
            .bind(to_rfc3339(agent.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Entry in the agent's document library.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DocumentRecord {
    pub id: String,
    pub agent_id: String,
    pub transaction_id: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub storage_path: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewDocumentRecord<'a> {
    pub id: &'a str,
    pub agent_id: &'a str,
    pub transaction_id: Option<&'a str>,
    pub name: &'a str,
    pub category: Option<&'a str>,
    pub storage_path: Option<&'a str>,
    pub file_size: Option<i64>,
    pub mime_type: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Repository for the `documents` table.
#[derive(Clone)]
pub struct DocumentRecordRepository {
    pool: SqlitePool,
}

impl DocumentRecordRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, id: &str) -> Result<Option<DocumentRecord>, sqlx::Error> {
        sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, agent_id, transaction_id, name, category, storage_path, file_size, mime_type, created_at \
             FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn insert(&self, record: &NewDocumentRecord<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO documents \
             (id, agent_id, transaction_id, name, category, storage_path, file_size, mime_type, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.agent_id)
        .bind(record.transaction_id)
        .bind(record.name)
        .bind(record.category)
        .bind(record.storage_path)
        .bind(record.file_size)
        .bind(record.mime_type)
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Document sent for e-signature, correlated with the provider by
/// `provider_document_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureDocument {
    pub id: String,
    pub agent_id: String,
    pub transaction_id: Option<String>,
    pub document_id: Option<String>,
    pub provider_document_id: String,
    pub title: String,
    pub status: DocumentStatus,
    pub signed_pdf_url: Option<String>,
    pub signed_pdf_storage_path: Option<String>,
    pub declined_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SignatureDocumentRow {
    id: String,
    agent_id: String,
    transaction_id: Option<String>,
    document_id: Option<String>,
    boldsign_document_id: String,
    title: String,
    status: String,
    signed_pdf_url: Option<String>,
    signed_pdf_storage_path: Option<String>,
    declined_reason: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl SignatureDocumentRow {
    fn into_domain(self) -> Result<SignatureDocument, SignatureDocumentError> {
        Ok(SignatureDocument {
            status: self.status.parse()?,
            id: self.id,
            agent_id: self.agent_id,
            transaction_id: self.transaction_id,
            document_id: self.document_id,
            provider_document_id: self.boldsign_document_id,
            title: self.title,
            signed_pdf_url: self.signed_pdf_url,
            signed_pdf_storage_path: self.signed_pdf_storage_path,
            declined_reason: self.declined_reason,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

const SIGNATURE_DOCUMENT_COLUMNS: &str = "id, agent_id, transaction_id, document_id, boldsign_document_id, title, status, \
     signed_pdf_url, signed_pdf_storage_path, declined_reason, expires_at, completed_at, updated_at";

pub struct NewSignatureDocument<'a> {
    pub id: &'a str,
    pub agent_id: &'a str,
    pub transaction_id: Option<&'a str>,
    pub document_id: Option<&'a str>,
    pub provider_document_id: &'a str,
    pub title: &'a str,
    pub status: DocumentStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusChange<'a> {
    pub completed_at: Option<DateTime<Utc>>,
    pub declined_reason: Option<&'a str>,
}

/// Repository for the `signature_documents` table.
#[derive(Clone)]
pub struct SignatureDocumentRepository {
    pool: SqlitePool,
}

impl SignatureDocumentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        doc: &NewSignatureDocument<'_>,
    ) -> Result<(), SignatureDocumentError> {
        let created_at = to_rfc3339(doc.created_at);
        sqlx::query(
            "INSERT INTO signature_documents \
             (id, agent_id, transaction_id, document_id, boldsign_document_id, title, status, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(doc.id)
        .bind(doc.agent_id)
        .bind(doc.transaction_id)
        .bind(doc.document_id)
        .bind(doc.provider_document_id)
        .bind(doc.title)
        .bind(doc.status.as_str())
        .bind(doc.expires_at.map(to_rfc3339))
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find(
        &self,
        id: &str,
    ) -> Result<Option<SignatureDocument>, SignatureDocumentError> {
        let row = sqlx::query_as::<_, SignatureDocumentRow>(&format!(
            "SELECT {SIGNATURE_DOCUMENT_COLUMNS} FROM signature_documents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SignatureDocumentRow::into_domain).transpose()
    }

    /// Looks up the document by the provider's correlation id.
    pub async fn find_by_provider_id(
        &self,
        provider_document_id: &str,
    ) -> Result<Option<SignatureDocument>, SignatureDocumentError> {
        let row = sqlx::query_as::<_, SignatureDocumentRow>(&format!(
            "SELECT {SIGNATURE_DOCUMENT_COLUMNS} FROM signature_documents WHERE boldsign_document_id = ?"
        ))
        .bind(provider_document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SignatureDocumentRow::into_domain).transpose()
    }

    /// Moves the document from `from` to `to`. Returns `false` when the stored
    /// status no longer equals `from`, leaving the row unchanged.
    pub async fn transition_status(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
        change: &StatusChange<'_>,
        at: DateTime<Utc>,
    ) -> Result<bool, SignatureDocumentError> {
        let result = sqlx::query(
            "UPDATE signature_documents \
             SET status = ?, \
                 completed_at = COALESCE(?, completed_at), \
                 declined_reason = COALESCE(?, declined_reason), \
                 updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(change.completed_at.map(to_rfc3339))
        .bind(change.declined_reason)
        .bind(to_rfc3339(at))
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records where the signed PDF was stored.
    pub async fn set_signed_pdf(
        &self,
        id: &str,
        url: Option<&str>,
        storage_path: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SignatureDocumentError> {
        sqlx::query(
            "UPDATE signature_documents \
             SET signed_pdf_url = ?, signed_pdf_storage_path = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(url)
        .bind(storage_path)
        .bind(to_rfc3339(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Errors that can occur while reading or writing signature documents.
#[derive(Debug, Error)]
pub enum SignatureDocumentError {
    #[error("stored status is invalid: {0}")]
    InvalidStatus(#[from] UnknownVariant),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

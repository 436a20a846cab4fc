use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use esign_core::types::{LedgerTransactionType, UnknownVariant};

use crate::{is_unique_violation, to_rfc3339};

/// Repository for the append-only `credit_ledger` table.
///
/// The agent's balance is the `balance_after` of the most recent entry; it is
/// never recomputed by summing amounts.
#[derive(Clone)]
pub struct CreditLedgerRepository {
    pool: SqlitePool,
}

impl CreditLedgerRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current balance; zero when the agent has no entries.
    pub async fn latest_balance(&self, agent_id: &str) -> Result<i64, CreditLedgerError> {
        let balance: Option<i64> = sqlx::query_scalar(LATEST_BALANCE_SQL)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance.unwrap_or(0))
    }

    /// Returns `true` when an entry of `transaction_type` exists for the
    /// agent and signature document.
    pub async fn has_entry(
        &self,
        agent_id: &str,
        signature_document_id: &str,
        transaction_type: LedgerTransactionType,
    ) -> Result<bool, CreditLedgerError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(\
                SELECT 1 FROM credit_ledger \
                 WHERE agent_id = ? AND signature_document_id = ? AND transaction_type = ?)",
        )
        .bind(agent_id)
        .bind(signature_document_id)
        .bind(transaction_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    /// Appends an entry whose `balance_after` is the latest balance plus
    /// `amount`, read and written inside one transaction. A unique-index
    /// collision is reported as [`AppendOutcome::Duplicate`].
    pub async fn append(
        &self,
        entry: &NewLedgerEntry<'_>,
    ) -> Result<AppendOutcome, CreditLedgerError> {
        let mut tx = self.pool.begin().await?;
        match Self::append_in(&mut tx, entry).await {
            Ok(balance_after) => {
                tx.commit().await?;
                Ok(AppendOutcome::Inserted { balance_after })
            }
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                Ok(AppendOutcome::Duplicate)
            }
            Err(err) => Err(CreditLedgerError::Database(err)),
        }
    }

    async fn append_in(
        tx: &mut Transaction<'_, Sqlite>,
        entry: &NewLedgerEntry<'_>,
    ) -> Result<i64, sqlx::Error> {
        let previous: Option<i64> = sqlx::query_scalar(LATEST_BALANCE_SQL)
            .bind(entry.agent_id)
            .fetch_optional(&mut **tx)
            .await?;
        let balance_after = previous.unwrap_or(0) + entry.amount;

        sqlx::query(
            "INSERT INTO credit_ledger \
             (id, agent_id, transaction_type, amount, balance_after, signature_document_id, description, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(entry.agent_id)
        .bind(entry.transaction_type.as_str())
        .bind(entry.amount)
        .bind(balance_after)
        .bind(entry.signature_document_id)
        .bind(entry.description)
        .bind(to_rfc3339(entry.created_at))
        .execute(&mut **tx)
        .await?;

        Ok(balance_after)
    }

    /// Lists the agent's entries, oldest first.
    pub async fn list_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<LedgerEntry>, CreditLedgerError> {
        let rows = sqlx::query_as::<_, LedgerEntryRow>(
            "SELECT id, agent_id, transaction_type, amount, balance_after, signature_document_id, description, created_at \
             FROM credit_ledger WHERE agent_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntryRow::into_domain).collect()
    }
}

const LATEST_BALANCE_SQL: &str = "SELECT balance_after FROM credit_ledger \
     WHERE agent_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1";

/// Payload for a new ledger entry. `amount` is signed.
pub struct NewLedgerEntry<'a> {
    pub agent_id: &'a str,
    pub transaction_type: LedgerTransactionType,
    pub amount: i64,
    pub signature_document_id: Option<&'a str>,
    pub description: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Result of [`CreditLedgerRepository::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { balance_after: i64 },
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub id: String,
    pub agent_id: String,
    pub transaction_type: LedgerTransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub signature_document_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LedgerEntryRow {
    id: String,
    agent_id: String,
    transaction_type: String,
    amount: i64,
    balance_after: i64,
    signature_document_id: Option<String>,
    description: String,
    created_at: DateTime<Utc>,
}

impl LedgerEntryRow {
    fn into_domain(self) -> Result<LedgerEntry, CreditLedgerError> {
        Ok(LedgerEntry {
            transaction_type: self.transaction_type.parse()?,
            id: self.id,
            agent_id: self.agent_id,
            amount: self.amount,
            balance_after: self.balance_after,
            signature_document_id: self.signature_document_id,
            description: self.description,
            created_at: self.created_at,
        })
    }
}

/// Errors that can occur while reading or appending ledger entries.
#[derive(Debug, Error)]
pub enum CreditLedgerError {
    #[error("stored transaction type is invalid: {0}")]
    InvalidTransactionType(#[from] UnknownVariant),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_now, setup_db};
    use chrono::Duration;

    fn entry(
        transaction_type: LedgerTransactionType,
        amount: i64,
        minutes: i64,
    ) -> NewLedgerEntry<'static> {
        NewLedgerEntry {
            agent_id: "agent-1",
            transaction_type,
            amount,
            signature_document_id: Some("sig-1"),
            description: "test entry",
            created_at: fixed_now() + Duration::minutes(minutes),
        }
    }

    #[tokio::test]
    async fn balance_follows_latest_entry() {
        let db = setup_db().await;
        let repo = db.credit_ledger();
        assert_eq!(repo.latest_balance("agent-1").await.expect("balance"), 0);

        let outcome = repo
            .append(&NewLedgerEntry {
                signature_document_id: None,
                ..entry(LedgerTransactionType::Purchase, 6, 0)
            })
            .await
            .expect("purchase");
        assert_eq!(outcome, AppendOutcome::Inserted { balance_after: 6 });

        let outcome = repo
            .append(&entry(LedgerTransactionType::SendDebit, -1, 1))
            .await
            .expect("debit");
        assert_eq!(outcome, AppendOutcome::Inserted { balance_after: 5 });
        assert_eq!(repo.latest_balance("agent-1").await.expect("balance"), 5);
        assert!(repo
            .has_entry("agent-1", "sig-1", LedgerTransactionType::SendDebit)
            .await
            .expect("lookup"));
    }

    #[tokio::test]
    async fn unique_index_rejects_second_refund_of_same_kind() {
        let db = setup_db().await;
        let repo = db.credit_ledger();
        repo.append(&entry(LedgerTransactionType::SendDebit, -1, 0))
            .await
            .expect("debit");

        let first = repo
            .append(&entry(LedgerTransactionType::DeclineRefund, 1, 1))
            .await
            .expect("refund");
        assert_eq!(first, AppendOutcome::Inserted { balance_after: 0 });

        let second = repo
            .append(&entry(LedgerTransactionType::DeclineRefund, 1, 2))
            .await
            .expect("duplicate is not an error");
        assert_eq!(second, AppendOutcome::Duplicate);

        let entries = repo.list_for_agent("agent-1").await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].transaction_type, LedgerTransactionType::DeclineRefund);
        assert_eq!(repo.latest_balance("agent-1").await.expect("balance"), 0);
    }

    #[tokio::test]
    async fn debits_are_not_constrained_by_refund_index() {
        let db = setup_db().await;
        let repo = db.credit_ledger();
        repo.append(&entry(LedgerTransactionType::SendDebit, -1, 0))
            .await
            .expect("first debit");
        let outcome = repo
            .append(&entry(LedgerTransactionType::SendDebit, -1, 1))
            .await
            .expect("resend debit");
        assert_eq!(outcome, AppendOutcome::Inserted { balance_after: -2 });
    }
}

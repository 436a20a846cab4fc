use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use esign_core::types::{LedgerTransactionType, RefundReason, REFUND_AMOUNT};
use esign_storage::{
    AppendOutcome, CreditLedgerError, Database, NewLedgerEntry, SignatureDocumentError,
};

/// Returns send credits to agents when a document is declined or revoked.
#[derive(Clone)]
pub struct CreditReconciler {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl CreditReconciler {
    pub fn new(database: Database, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        Self { database, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Credits back the send cost of a signature document at most once per
    /// reason. Documents that were never debited are not refunded.
    pub async fn refund_credit(
        &self,
        signature_document_id: &str,
        reason: RefundReason,
    ) -> Result<RefundOutcome, CreditError> {
        let outcome = self.try_refund(signature_document_id, reason).await;
        let label = match &outcome {
            Ok(outcome) => outcome.metric_label(),
            Err(_) => "error",
        };
        counter!("credit_refunds_total", "reason" => reason.as_str(), "outcome" => label)
            .increment(1);
        outcome
    }

    async fn try_refund(
        &self,
        signature_document_id: &str,
        reason: RefundReason,
    ) -> Result<RefundOutcome, CreditError> {
        let Some(document) = self
            .database
            .signature_documents()
            .find(signature_document_id)
            .await?
        else {
            warn!(
                stage = "credits",
                signature_document_id,
                "refund requested for unknown document"
            );
            return Ok(RefundOutcome::DocumentNotFound);
        };

        let ledger = self.database.credit_ledger();
        let agent_id = document.agent_id.as_str();
        if !ledger
            .has_entry(agent_id, &document.id, LedgerTransactionType::SendDebit)
            .await?
        {
            info!(
                stage = "credits",
                signature_document_id,
                agent_id,
                "no send debit recorded; nothing to refund"
            );
            return Ok(RefundOutcome::NoDebit);
        }

        let refund_type = reason.transaction_type();
        if ledger.has_entry(agent_id, &document.id, refund_type).await? {
            info!(
                stage = "credits",
                signature_document_id,
                reason = reason.as_str(),
                "credit already refunded"
            );
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        let description = reason.describe(&document.title);
        let appended = ledger
            .append(&NewLedgerEntry {
                agent_id,
                transaction_type: refund_type,
                amount: REFUND_AMOUNT,
                signature_document_id: Some(&document.id),
                description: &description,
                created_at: self.now(),
            })
            .await?;

        match appended {
            AppendOutcome::Inserted { balance_after } => {
                info!(
                    stage = "credits",
                    signature_document_id,
                    agent_id,
                    reason = reason.as_str(),
                    balance_after,
                    "credit refunded"
                );
                Ok(RefundOutcome::Refunded { balance_after })
            }
            // Lost a race against a concurrent delivery of the same event.
            AppendOutcome::Duplicate => Ok(RefundOutcome::AlreadyRefunded),
        }
    }

    /// Agent's balance after the latest ledger entry.
    #[cfg(test)]
    pub async fn current_balance(&self, agent_id: &str) -> Result<i64, CreditError> {
        Ok(self.database.credit_ledger().latest_balance(agent_id).await?)
    }

    /// Charges the send cost when a document goes out for signature.
    #[cfg(test)]
    pub async fn record_debit(
        &self,
        agent_id: &str,
        signature_document_id: &str,
        document_title: &str,
    ) -> Result<i64, CreditError> {
        let description = format!("Sent \"{document_title}\" for signature");
        let appended = self
            .database
            .credit_ledger()
            .append(&NewLedgerEntry {
                agent_id,
                transaction_type: LedgerTransactionType::SendDebit,
                amount: -esign_core::types::SEND_COST,
                signature_document_id: Some(signature_document_id),
                description: &description,
                created_at: self.now(),
            })
            .await?;

        match appended {
            AppendOutcome::Inserted { balance_after } => Ok(balance_after),
            AppendOutcome::Duplicate => self.current_balance(agent_id).await,
        }
    }
}

/// Result of [`CreditReconciler::refund_credit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { balance_after: i64 },
    AlreadyRefunded,
    NoDebit,
    DocumentNotFound,
}

impl RefundOutcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Refunded { .. } => "refunded",
            Self::AlreadyRefunded => "already_refunded",
            Self::NoDebit => "no_debit",
            Self::DocumentNotFound => "document_not_found",
        }
    }
}

#[derive(Debug, Error)]
pub enum CreditError {
    #[error(transparent)]
    Document(#[from] SignatureDocumentError),
    #[error(transparent)]
    Ledger(#[from] CreditLedgerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_clock, fixed_now, seed_database, seed_signature_document};
    use esign_core::types::DocumentStatus;

    async fn reconciler() -> (CreditReconciler, Database) {
        let database = seed_database().await;
        seed_signature_document(&database, "sig-1", "bs-1", DocumentStatus::Sent).await;
        let reconciler = CreditReconciler::new(database.clone(), fixed_clock());
        (reconciler, database)
    }

    #[tokio::test]
    async fn refunds_once_per_reason() {
        let (reconciler, database) = reconciler().await;
        reconciler
            .record_debit("agent-1", "sig-1", "Purchase Agreement")
            .await
            .expect("debit");
        assert_eq!(reconciler.current_balance("agent-1").await.expect("balance"), 5);

        let first = reconciler
            .refund_credit("sig-1", RefundReason::Declined)
            .await
            .expect("refund");
        assert_eq!(first, RefundOutcome::Refunded { balance_after: 6 });

        let second = reconciler
            .refund_credit("sig-1", RefundReason::Declined)
            .await
            .expect("refund again");
        assert_eq!(second, RefundOutcome::AlreadyRefunded);
        assert_eq!(reconciler.current_balance("agent-1").await.expect("balance"), 6);

        let refunds = database
            .credit_ledger()
            .list_for_agent("agent-1")
            .await
            .expect("entries")
            .into_iter()
            .filter(|entry| entry.transaction_type == LedgerTransactionType::DeclineRefund)
            .collect::<Vec<_>>();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, REFUND_AMOUNT);
        assert_eq!(refunds[0].created_at, fixed_now());
        assert!(refunds[0].description.contains("Purchase Agreement"));
    }

    #[tokio::test]
    async fn no_refund_without_prior_debit() {
        let (reconciler, _database) = reconciler().await;
        let outcome = reconciler
            .refund_credit("sig-1", RefundReason::Revoked)
            .await
            .expect("refund");
        assert_eq!(outcome, RefundOutcome::NoDebit);
        assert_eq!(reconciler.current_balance("agent-1").await.expect("balance"), 6);
    }

    #[tokio::test]
    async fn unknown_document_is_reported() {
        let (reconciler, _database) = reconciler().await;
        let outcome = reconciler
            .refund_credit("missing", RefundReason::Declined)
            .await
            .expect("refund");
        assert_eq!(outcome, RefundOutcome::DocumentNotFound);
    }

    #[tokio::test]
    async fn decline_and_revoke_refunds_are_tracked_separately() {
        let (reconciler, _database) = reconciler().await;
        reconciler
            .record_debit("agent-1", "sig-1", "Lease")
            .await
            .expect("debit");

        let declined = reconciler
            .refund_credit("sig-1", RefundReason::Declined)
            .await
            .expect("declined");
        let revoked = reconciler
            .refund_credit("sig-1", RefundReason::Revoked)
            .await
            .expect("revoked");
        assert_eq!(declined, RefundOutcome::Refunded { balance_after: 6 });
        assert_eq!(revoked, RefundOutcome::Refunded { balance_after: 7 });
    }
}

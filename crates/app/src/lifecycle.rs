use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use esign_core::events::ProviderEvent;
use esign_core::lifecycle::{LifecycleEffect, LifecyclePlan, LifecyclePolicy, PlanAction};
use esign_core::types::{DocumentStatus, NotificationKind};
use esign_providers::{BoldSignClient, ObjectStoreClient};
use esign_storage::{
    Database, NewDocumentRecord, SignatureDocument, SignatureDocumentError, StatusChange,
};

use crate::credits::{CreditError, CreditReconciler};
use crate::notify::{Notification, Notifier, TemplateContext};

/// Lifetime of the download link stored for a signed PDF.
const SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Applies decoded provider events to signature documents and runs the
/// resulting side effects in order.
#[derive(Clone)]
pub struct LifecycleExecutor {
    database: Database,
    boldsign: BoldSignClient,
    object_store: ObjectStoreClient,
    credits: CreditReconciler,
    notifier: Notifier,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl LifecycleExecutor {
    pub fn new(
        database: Database,
        boldsign: BoldSignClient,
        object_store: ObjectStoreClient,
        notifier: Notifier,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        let credits = CreditReconciler::new(database.clone(), clock.clone());
        Self {
            database,
            boldsign,
            object_store,
            credits,
            notifier,
            clock,
        }
    }

    #[cfg(test)]
    pub fn credits(&self) -> &CreditReconciler {
        &self.credits
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Applies `event` to the matching signature document. Failures of the
    /// PDF fetch and of email delivery are logged and absorbed; storage and
    /// ledger failures are returned so the delivery can be retried.
    pub async fn apply(&self, event: &ProviderEvent) -> Result<LifecycleOutcome, LifecycleError> {
        let label = event.metric_label();
        if matches!(event, ProviderEvent::Unknown { .. }) || event.is_signer_informational() {
            info!(
                stage = "lifecycle",
                event = label,
                document_id = event.document_id().unwrap_or_default(),
                "informational event recorded"
            );
            return Ok(LifecycleOutcome::LogOnly);
        }

        let Some(provider_document_id) = event.document_id() else {
            return Ok(LifecycleOutcome::LogOnly);
        };

        let Some(document) = self
            .database
            .signature_documents()
            .find_by_provider_id(provider_document_id)
            .await?
        else {
            warn!(
                stage = "lifecycle",
                event = label,
                document_id = provider_document_id,
                "no signature document matches event; dropping"
            );
            return Ok(LifecycleOutcome::DocumentNotFound);
        };

        let plan = LifecyclePolicy::evaluate(event, document.status);
        match plan.action {
            PlanAction::LogOnly => Ok(LifecycleOutcome::LogOnly),
            PlanAction::Skipped => {
                info!(
                    stage = "lifecycle",
                    event = label,
                    signature_document_id = %document.id,
                    status = %document.status,
                    reason = plan.reason.unwrap_or_default(),
                    "transition skipped"
                );
                self.run_effects(&plan, &document, event).await?;
                Ok(LifecycleOutcome::Skipped)
            }
            PlanAction::Transition => self.transition(&plan, document, event).await,
        }
    }

    async fn transition(
        &self,
        plan: &LifecyclePlan,
        mut document: SignatureDocument,
        event: &ProviderEvent,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let Some(next) = plan.next_status else {
            return Ok(LifecycleOutcome::LogOnly);
        };
        let now = self.now();
        let completed_at = match event {
            ProviderEvent::DocumentCompleted { completed_at, .. } => {
                Some(self.resolve_completed_at(&document, *completed_at, now).await)
            }
            _ => None,
        };
        let change = status_change(event, next, completed_at);

        let applied = self
            .database
            .signature_documents()
            .transition_status(&document.id, document.status, next, &change, now)
            .await?;
        if !applied {
            warn!(
                stage = "lifecycle",
                signature_document_id = %document.id,
                from = %document.status,
                to = %next,
                "status changed concurrently; transition not applied"
            );
            return Ok(LifecycleOutcome::Skipped);
        }

        let from = document.status;
        info!(
            stage = "lifecycle",
            signature_document_id = %document.id,
            %from,
            to = %next,
            "status updated"
        );
        document.status = next;
        document.completed_at = change.completed_at.or(document.completed_at);
        if let Some(reason) = change.declined_reason {
            document.declined_reason = Some(reason.to_string());
        }

        self.run_effects(plan, &document, event).await?;
        Ok(LifecycleOutcome::Applied { from, to: next })
    }

    /// Completion time from the event, else from the provider, else `now`.
    async fn resolve_completed_at(
        &self,
        document: &SignatureDocument,
        from_event: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if let Some(at) = from_event {
            return at;
        }
        match self
            .boldsign
            .document_properties(&document.provider_document_id)
            .await
        {
            Ok(properties) => properties.completed_at().unwrap_or(now),
            Err(err) => {
                warn!(
                    stage = "lifecycle",
                    signature_document_id = %document.id,
                    error = %err,
                    "failed to fetch document properties"
                );
                now
            }
        }
    }

    async fn run_effects(
        &self,
        plan: &LifecyclePlan,
        document: &SignatureDocument,
        event: &ProviderEvent,
    ) -> Result<(), LifecycleError> {
        let mut signed_pdf_url = document.signed_pdf_url.clone();

        for effect in &plan.effects {
            match *effect {
                LifecycleEffect::FetchSignedPdf => {
                    if let Some(url) = self.store_signed_pdf(document).await {
                        signed_pdf_url = Some(url);
                    }
                }
                LifecycleEffect::RefundCredit(reason) => {
                    self.credits.refund_credit(&document.id, reason).await?;
                }
                LifecycleEffect::Notify(kind) => {
                    self.send_notification(kind, document, event, signed_pdf_url.as_deref())
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Downloads the signed PDF, uploads it to object storage and records
    /// where it lives. Returns the signed download URL when every step
    /// succeeded.
    async fn store_signed_pdf(&self, document: &SignatureDocument) -> Option<String> {
        let bytes = match self
            .boldsign
            .download_signed_pdf(&document.provider_document_id)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    stage = "lifecycle",
                    signature_document_id = %document.id,
                    error = %err,
                    "failed to download signed pdf"
                );
                return None;
            }
        };

        let path = signed_pdf_path(document);
        let size = bytes.len() as i64;
        if let Err(err) = self.object_store.upload(&path, bytes, PDF_CONTENT_TYPE).await {
            warn!(
                stage = "lifecycle",
                signature_document_id = %document.id,
                %path,
                error = %err,
                "failed to upload signed pdf"
            );
            return None;
        }

        let url = match self.object_store.signed_url(&path, SIGNED_URL_TTL).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(
                    stage = "lifecycle",
                    signature_document_id = %document.id,
                    %path,
                    error = %err,
                    "failed to sign pdf url"
                );
                None
            }
        };

        let now = self.now();
        if let Err(err) = self
            .database
            .signature_documents()
            .set_signed_pdf(&document.id, url.as_deref(), &path, now)
            .await
        {
            warn!(
                stage = "lifecycle",
                signature_document_id = %document.id,
                error = %err,
                "failed to record signed pdf"
            );
            return None;
        }

        if let Err(err) = self.record_signed_copy(document, &path, size, now).await {
            warn!(
                stage = "lifecycle",
                signature_document_id = %document.id,
                error = %err,
                "failed to create signed document record"
            );
        }

        url
    }

    async fn record_signed_copy(
        &self,
        document: &SignatureDocument,
        path: &str,
        size: i64,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let records = self.database.documents();
        let original = match document.document_id.as_deref() {
            Some(id) => records.find(id).await?,
            None => None,
        };
        let base_name = original
            .as_ref()
            .map(|record| record.name.as_str())
            .unwrap_or(document.title.as_str());
        let name = format!("{base_name} — Signed");
        let id = Uuid::new_v4().to_string();

        records
            .insert(&NewDocumentRecord {
                id: &id,
                agent_id: &document.agent_id,
                transaction_id: document.transaction_id.as_deref(),
                name: &name,
                category: original.as_ref().and_then(|record| record.category.as_deref()),
                storage_path: Some(path),
                file_size: Some(size),
                mime_type: Some(PDF_CONTENT_TYPE),
                created_at: now,
            })
            .await
    }

    async fn send_notification(
        &self,
        kind: NotificationKind,
        document: &SignatureDocument,
        event: &ProviderEvent,
        signed_pdf_url: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let Some(agent) = self.database.agents().find(&document.agent_id).await? else {
            warn!(
                stage = "lifecycle",
                agent_id = %document.agent_id,
                "agent missing; notification skipped"
            );
            return Ok(());
        };

        let links = self.notifier.links();
        let transaction_id = document.transaction_id.as_deref();
        let link = match kind {
            NotificationKind::Completed => signed_pdf_url
                .map(str::to_string)
                .unwrap_or_else(|| links.document_link(transaction_id)),
            NotificationKind::Expired => links.resend_link(transaction_id, &document.id),
            NotificationKind::Sent | NotificationKind::Declined => {
                links.document_link(transaction_id)
            }
        };
        let reason = match event {
            ProviderEvent::DocumentDeclined { reason, .. } => reason.as_deref(),
            _ => None,
        }
        .or(document.declined_reason.as_deref());

        let delivery = self
            .notifier
            .notify(&Notification {
                kind,
                recipient: &agent.email,
                template: TemplateContext {
                    agent_name: &agent.display_name,
                    document_title: &document.title,
                    link: &link,
                    reason,
                },
            })
            .await;

        if !delivery.success {
            warn!(
                stage = "lifecycle",
                signature_document_id = %document.id,
                template = kind.as_str(),
                attempts = delivery.attempts,
                error = delivery.error.as_deref().unwrap_or_default(),
                "notification not delivered"
            );
        }
        Ok(())
    }
}

fn status_change(
    event: &ProviderEvent,
    next: DocumentStatus,
    completed_at: Option<DateTime<Utc>>,
) -> StatusChange<'_> {
    match (event, next) {
        (ProviderEvent::DocumentCompleted { .. }, DocumentStatus::Completed) => StatusChange {
            completed_at,
            ..StatusChange::default()
        },
        (ProviderEvent::DocumentDeclined { reason, .. }, DocumentStatus::Declined) => StatusChange {
            declined_reason: reason.as_deref(),
            ..StatusChange::default()
        },
        _ => StatusChange::default(),
    }
}

/// `documents/{transactionId}/{documentRecordId}/signed.pdf`, or a path keyed
/// by the signature document when it is not linked to both.
pub fn signed_pdf_path(document: &SignatureDocument) -> String {
    match (document.transaction_id.as_deref(), document.document_id.as_deref()) {
        (Some(transaction_id), Some(record_id)) => {
            format!("documents/{transaction_id}/{record_id}/signed.pdf")
        }
        _ => format!("documents/signatures/{}/signed.pdf", document.id),
    }
}

/// What happened to the document when an event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Applied {
        from: DocumentStatus,
        to: DocumentStatus,
    },
    Skipped,
    LogOnly,
    DocumentNotFound,
}

impl LifecycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Skipped => "skipped",
            Self::LogOnly => "log_only",
            Self::DocumentNotFound => "document_not_found",
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Document(#[from] SignatureDocumentError),
    #[error(transparent)]
    Credits(#[from] CreditError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_now, harness, TEST_SECRET};
    use esign_core::types::LedgerTransactionType;

    fn document(transaction_id: Option<&str>, document_id: Option<&str>) -> SignatureDocument {
        SignatureDocument {
            id: "sig-9".into(),
            agent_id: "agent-1".into(),
            transaction_id: transaction_id.map(str::to_string),
            document_id: document_id.map(str::to_string),
            provider_document_id: "bs-9".into(),
            title: "Lease".into(),
            status: DocumentStatus::InProgress,
            signed_pdf_url: None,
            signed_pdf_storage_path: None,
            declined_reason: None,
            expires_at: None,
            completed_at: None,
            updated_at: fixed_now(),
        }
    }

    #[test]
    fn signed_pdf_path_prefers_transaction_layout() {
        assert_eq!(
            signed_pdf_path(&document(Some("tx-1"), Some("rec-1"))),
            "documents/tx-1/rec-1/signed.pdf"
        );
        assert_eq!(
            signed_pdf_path(&document(Some("tx-1"), None)),
            "documents/signatures/sig-9/signed.pdf"
        );
        assert_eq!(
            signed_pdf_path(&document(None, None)),
            "documents/signatures/sig-9/signed.pdf"
        );
    }

    #[tokio::test]
    async fn completion_time_falls_back_to_provider_then_now() {
        let harness = harness(Some(TEST_SECRET)).await;
        let executor = harness.state.lifecycle();
        let doc = document(Some("tx-1"), Some("rec-1"));

        let unreachable = executor.resolve_completed_at(&doc, None, fixed_now()).await;
        assert_eq!(unreachable, fixed_now());

        harness
            .provider
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/v1/document/properties")
                    .query_param("documentId", "bs-9");
                then.status(200).json_body(serde_json::json!({
                    "documentId": "bs-9",
                    "completedDate": 1704070800
                }));
            })
            .await;
        let from_provider = executor.resolve_completed_at(&doc, None, fixed_now()).await;
        assert_eq!(from_provider, fixed_now() + chrono::Duration::hours(1));

        let from_event = executor
            .resolve_completed_at(&doc, Some(fixed_now()), fixed_now())
            .await;
        assert_eq!(from_event, fixed_now());
    }

    #[test]
    fn decline_reason_is_carried_into_status_change() {
        let event = ProviderEvent::DocumentDeclined {
            document_id: "bs-9".into(),
            reason: Some("Price".into()),
        };
        let change = status_change(&event, DocumentStatus::Declined, None);
        assert_eq!(change.declined_reason, Some("Price"));
        assert!(change.completed_at.is_none());
    }

    #[tokio::test]
    async fn revoke_event_refunds_document_revoked_locally() {
        let harness = harness(Some(TEST_SECRET)).await;
        harness.seed_document("sig-1", "bs-1", DocumentStatus::Revoked).await;
        let executor = harness.state.lifecycle();
        executor
            .credits()
            .record_debit("agent-1", "sig-1", "Purchase Agreement")
            .await
            .expect("debit");

        let outcome = executor
            .apply(&ProviderEvent::DocumentRevoked {
                document_id: "bs-1".into(),
                reason: None,
            })
            .await
            .expect("apply");
        assert_eq!(outcome, LifecycleOutcome::Skipped);

        let entries = harness
            .database
            .credit_ledger()
            .list_for_agent("agent-1")
            .await
            .expect("ledger");
        let last = entries.last().expect("entry");
        assert_eq!(last.transaction_type, LedgerTransactionType::RevokeRefund);
        assert_eq!(last.balance_after, 6);
        assert_eq!(harness.transport.calls(), 0);
    }

    #[tokio::test]
    async fn missing_document_is_dropped() {
        let harness = harness(Some(TEST_SECRET)).await;
        let outcome = harness
            .state
            .lifecycle()
            .apply(&ProviderEvent::DocumentExpired {
                document_id: "bs-unknown".into(),
            })
            .await
            .expect("apply");
        assert_eq!(outcome, LifecycleOutcome::DocumentNotFound);
    }

    #[tokio::test]
    async fn expired_notification_links_to_resend() {
        let harness = harness(Some(TEST_SECRET)).await;
        harness.seed_document("sig-1", "bs-1", DocumentStatus::Sent).await;

        let outcome = harness
            .state
            .lifecycle()
            .apply(&ProviderEvent::DocumentExpired {
                document_id: "bs-1".into(),
            })
            .await
            .expect("apply");
        assert_eq!(
            outcome,
            LifecycleOutcome::Applied {
                from: DocumentStatus::Sent,
                to: DocumentStatus::Expired
            }
        );

        let sent = harness.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]
            .html
            .contains("https://app.example.com/transactions/tx-1?resend=sig-1"));
    }
}

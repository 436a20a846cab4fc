use crate::events::ProviderEvent;
use crate::types::{DocumentStatus, NotificationKind, RefundReason};

/// Side effect requested by a lifecycle decision, executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEffect {
    FetchSignedPdf,
    RefundCredit(RefundReason),
    Notify(NotificationKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// Status changes to `next_status`.
    Transition,
    /// Event is recorded in logs only.
    LogOnly,
    /// Event is not applicable to the document's current status.
    Skipped,
}

/// Outcome of evaluating one provider event against a document's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePlan {
    pub action: PlanAction,
    pub next_status: Option<DocumentStatus>,
    pub effects: Vec<LifecycleEffect>,
    pub reason: Option<&'static str>,
}

impl LifecyclePlan {
    fn transition(next: DocumentStatus, effects: Vec<LifecycleEffect>) -> Self {
        Self {
            action: PlanAction::Transition,
            next_status: Some(next),
            effects,
            reason: None,
        }
    }

    fn log_only(reason: &'static str) -> Self {
        Self {
            action: PlanAction::LogOnly,
            next_status: None,
            effects: Vec::new(),
            reason: Some(reason),
        }
    }

    fn skipped(reason: &'static str, effects: Vec<LifecycleEffect>) -> Self {
        Self {
            action: PlanAction::Skipped,
            next_status: None,
            effects,
            reason: Some(reason),
        }
    }
}

/// Maps provider events onto document status transitions and side effects.
pub struct LifecyclePolicy;

impl LifecyclePolicy {
    pub fn evaluate(event: &ProviderEvent, current: DocumentStatus) -> LifecyclePlan {
        use LifecycleEffect::*;

        match event {
            ProviderEvent::DocumentSent { .. } => {
                Self::advance(current, DocumentStatus::Sent, vec![Notify(NotificationKind::Sent)])
            }
            ProviderEvent::SignerCompleted { .. } => {
                Self::advance(current, DocumentStatus::InProgress, Vec::new())
            }
            ProviderEvent::SignerViewed { .. } => LifecyclePlan::log_only("signer_viewed"),
            ProviderEvent::SignerDeclined { .. } => LifecyclePlan::log_only("signer_declined"),
            ProviderEvent::DocumentCompleted { .. } => Self::advance(
                current,
                DocumentStatus::Completed,
                vec![FetchSignedPdf, Notify(NotificationKind::Completed)],
            ),
            ProviderEvent::DocumentDeclined { .. } => Self::terminate(
                current,
                DocumentStatus::Declined,
                RefundReason::Declined,
                Some(NotificationKind::Declined),
            ),
            ProviderEvent::DocumentExpired { .. } => Self::advance(
                current,
                DocumentStatus::Expired,
                vec![Notify(NotificationKind::Expired)],
            ),
            ProviderEvent::DocumentRevoked { .. } => {
                Self::terminate(current, DocumentStatus::Revoked, RefundReason::Revoked, None)
            }
            ProviderEvent::Unknown { .. } => LifecyclePlan::log_only("unknown_event"),
        }
    }

    fn advance(
        current: DocumentStatus,
        next: DocumentStatus,
        effects: Vec<LifecycleEffect>,
    ) -> LifecyclePlan {
        if current.can_transition_to(next) {
            LifecyclePlan::transition(next, effects)
        } else {
            LifecyclePlan::skipped("transition_not_allowed", Vec::new())
        }
    }

    /// Declines and revocations refund the send credit. When the document
    /// already sits in the same terminal status (for example an agent revoked
    /// it locally before the provider event arrived) the refund is still
    /// requested; the ledger keeps it to a single entry.
    fn terminate(
        current: DocumentStatus,
        next: DocumentStatus,
        refund: RefundReason,
        notify: Option<NotificationKind>,
    ) -> LifecyclePlan {
        if current.can_transition_to(next) {
            let mut effects = vec![LifecycleEffect::RefundCredit(refund)];
            effects.extend(notify.map(LifecycleEffect::Notify));
            LifecyclePlan::transition(next, effects)
        } else if current == next {
            LifecyclePlan::skipped(
                "already_in_status",
                vec![LifecycleEffect::RefundCredit(refund)],
            )
        } else {
            LifecyclePlan::skipped("transition_not_allowed", Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent() -> ProviderEvent {
        ProviderEvent::DocumentSent {
            document_id: "d1".into(),
        }
    }

    fn declined() -> ProviderEvent {
        ProviderEvent::DocumentDeclined {
            document_id: "d1".into(),
            reason: None,
        }
    }

    fn revoked() -> ProviderEvent {
        ProviderEvent::DocumentRevoked {
            document_id: "d1".into(),
            reason: None,
        }
    }

    #[test]
    fn sent_from_draft_transitions_and_notifies() {
        let plan = LifecyclePolicy::evaluate(&sent(), DocumentStatus::Draft);
        assert_eq!(plan.action, PlanAction::Transition);
        assert_eq!(plan.next_status, Some(DocumentStatus::Sent));
        assert_eq!(
            plan.effects,
            vec![LifecycleEffect::Notify(NotificationKind::Sent)]
        );
    }

    #[test]
    fn signer_completed_never_regresses_completed_document() {
        let event = ProviderEvent::SignerCompleted {
            document_id: "d1".into(),
            signer_email: None,
        };
        let plan = LifecyclePolicy::evaluate(&event, DocumentStatus::Completed);
        assert_eq!(plan.action, PlanAction::Skipped);
        assert_eq!(plan.next_status, None);

        let plan = LifecyclePolicy::evaluate(&event, DocumentStatus::Sent);
        assert_eq!(plan.next_status, Some(DocumentStatus::InProgress));
        assert!(plan.effects.is_empty());
    }

    #[test]
    fn completed_fetches_pdf_before_notifying() {
        let event = ProviderEvent::DocumentCompleted {
            document_id: "d1".into(),
            completed_at: None,
        };
        let plan = LifecyclePolicy::evaluate(&event, DocumentStatus::InProgress);
        assert_eq!(
            plan.effects,
            vec![
                LifecycleEffect::FetchSignedPdf,
                LifecycleEffect::Notify(NotificationKind::Completed)
            ]
        );
    }

    #[test]
    fn declined_refunds_then_notifies() {
        let plan = LifecyclePolicy::evaluate(&declined(), DocumentStatus::Sent);
        assert_eq!(plan.next_status, Some(DocumentStatus::Declined));
        assert_eq!(
            plan.effects,
            vec![
                LifecycleEffect::RefundCredit(RefundReason::Declined),
                LifecycleEffect::Notify(NotificationKind::Declined)
            ]
        );
    }

    #[test]
    fn revoked_refunds_without_notification() {
        let plan = LifecyclePolicy::evaluate(&revoked(), DocumentStatus::InProgress);
        assert_eq!(plan.next_status, Some(DocumentStatus::Revoked));
        assert_eq!(
            plan.effects,
            vec![LifecycleEffect::RefundCredit(RefundReason::Revoked)]
        );
    }

    #[test]
    fn revoked_document_still_requests_refund() {
        let plan = LifecyclePolicy::evaluate(&revoked(), DocumentStatus::Revoked);
        assert_eq!(plan.action, PlanAction::Skipped);
        assert_eq!(plan.next_status, None);
        assert_eq!(
            plan.effects,
            vec![LifecycleEffect::RefundCredit(RefundReason::Revoked)]
        );
    }

    #[test]
    fn terminal_documents_ignore_every_event() {
        let events = [
            sent(),
            declined(),
            revoked(),
            ProviderEvent::DocumentExpired {
                document_id: "d1".into(),
            },
            ProviderEvent::DocumentCompleted {
                document_id: "d1".into(),
                completed_at: None,
            },
            ProviderEvent::SignerCompleted {
                document_id: "d1".into(),
                signer_email: None,
            },
        ];
        for status in [
            DocumentStatus::Completed,
            DocumentStatus::Declined,
            DocumentStatus::Expired,
            DocumentStatus::Revoked,
        ] {
            for event in &events {
                let plan = LifecyclePolicy::evaluate(event, status);
                assert_eq!(plan.next_status, None, "{status} changed on {event:?}");
                assert!(!plan
                    .effects
                    .iter()
                    .any(|effect| matches!(effect, LifecycleEffect::Notify(_))));
            }
        }
    }

    #[test]
    fn signer_level_events_are_log_only() {
        let event = ProviderEvent::SignerViewed {
            document_id: "d1".into(),
            signer_email: Some("a@example.com".into()),
        };
        let plan = LifecyclePolicy::evaluate(&event, DocumentStatus::Sent);
        assert_eq!(plan.action, PlanAction::LogOnly);
        assert!(plan.effects.is_empty());
    }
}

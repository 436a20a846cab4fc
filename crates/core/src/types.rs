use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Credits charged when a document is sent for signature.
pub const SEND_COST: i64 = 1;

/// Credits returned when a sent document is declined or revoked.
pub const REFUND_AMOUNT: i64 = 1;

/// Lifecycle status of a document sent for e-signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Sent,
    InProgress,
    Completed,
    Declined,
    Expired,
    Revoked,
}

impl DocumentStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    /// Terminal statuses accept no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Declined | Self::Expired | Self::Revoked
        )
    }

    /// Position along the happy path; `None` for the failure terminals.
    fn progress_rank(self) -> Option<u8> {
        match self {
            Self::Draft => Some(0),
            Self::Sent => Some(1),
            Self::InProgress => Some(2),
            Self::Completed => Some(3),
            Self::Declined | Self::Expired | Self::Revoked => None,
        }
    }

    /// Returns `true` when moving from `self` to `next` is a legal transition.
    ///
    /// Happy-path moves only go forward (`draft → sent → in_progress →
    /// completed`), skipping steps when provider events arrive out of order.
    /// Declined, expired and revoked are reachable from `sent` or
    /// `in_progress` only.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }

        match (self.progress_rank(), next.progress_rank()) {
            (Some(current), Some(target)) => target > current,
            (Some(_), None) => matches!(self, Self::Sent | Self::InProgress),
            _ => false,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "sent" => Ok(Self::Sent),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "declined" => Ok(Self::Declined),
            "expired" => Ok(Self::Expired),
            "revoked" => Ok(Self::Revoked),
            other => Err(UnknownVariant {
                kind: "document status",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of credit ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerTransactionType {
    Purchase,
    SendDebit,
    DeclineRefund,
    RevokeRefund,
    Adjustment,
}

impl LedgerTransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::SendDebit => "send_debit",
            Self::DeclineRefund => "decline_refund",
            Self::RevokeRefund => "revoke_refund",
            Self::Adjustment => "adjustment",
        }
    }
}

impl FromStr for LedgerTransactionType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "purchase" => Ok(Self::Purchase),
            "send_debit" => Ok(Self::SendDebit),
            "decline_refund" => Ok(Self::DeclineRefund),
            "revoke_refund" => Ok(Self::RevokeRefund),
            "adjustment" => Ok(Self::Adjustment),
            other => Err(UnknownVariant {
                kind: "ledger transaction type",
                value: other.to_string(),
            }),
        }
    }
}

/// Why a send credit is being returned to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Declined,
    Revoked,
}

impl RefundReason {
    /// Ledger tag used for the refund entry; distinct per reason.
    pub fn transaction_type(self) -> LedgerTransactionType {
        match self {
            Self::Declined => LedgerTransactionType::DeclineRefund,
            Self::Revoked => LedgerTransactionType::RevokeRefund,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Declined => "declined",
            Self::Revoked => "revoked",
        }
    }

    /// Human readable ledger description.
    pub fn describe(self, document_title: &str) -> String {
        match self {
            Self::Declined => format!("Refund: \"{document_title}\" was declined"),
            Self::Revoked => format!("Refund: \"{document_title}\" was revoked"),
        }
    }
}

/// Transactional emails sent to the issuing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Sent,
    Completed,
    Declined,
    Expired,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::Expired => "expired",
        }
    }
}

/// A stored string did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

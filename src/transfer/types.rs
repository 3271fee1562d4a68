//! Transfer Core Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::TransferError;
use super::state::TransferStatus;
use crate::core_types::{Points, TransferId, UserId};

/// Prefix of the idempotency keys the engine derives for reversals.
///
/// Reserved: caller-supplied keys may not start with it.
pub const REVERSAL_KEY_PREFIX: &str = "reversal:";

/// Largest amount a single transfer may move
pub const MAX_TRANSFER_AMOUNT: Points = 1_000_000_000_000;

/// Why a transfer ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Source balance below the amount when the atomic unit ran
    InsufficientFunds,
    /// The store failed mid-unit; nothing was applied
    StoreUnavailable,
    /// Found stranded in pending/processing by the recovery worker
    Abandoned,
    /// Ledger/balance mismatch detected; accounts quarantined
    InvariantViolation,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::InsufficientFunds => "insufficient_funds",
            FailReason::StoreUnavailable => "store_unavailable",
            FailReason::Abandoned => "abandoned",
            FailReason::InvariantViolation => "invariant_violation",
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insufficient_funds" => Ok(FailReason::InsufficientFunds),
            "store_unavailable" => Ok(FailReason::StoreUnavailable),
            "abandoned" => Ok(FailReason::Abandoned),
            "invariant_violation" => Ok(FailReason::InvariantViolation),
            other => Err(format!("unknown fail reason: {}", other)),
        }
    }
}

/// Transfer submission from the service layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    /// Strictly positive
    pub amount: Points,
    /// Caller-supplied, globally unique per logical request
    pub idempotency_key: String,
    pub note: Option<String>,
    /// Set only on compensating transfers built by the reversal path
    pub(crate) reversal_of: Option<TransferId>,
}

impl TransferRequest {
    pub fn new(
        from_user_id: UserId,
        to_user_id: UserId,
        amount: Points,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            from_user_id,
            to_user_id,
            amount,
            idempotency_key: idempotency_key.into(),
            note: None,
            reversal_of: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Compensating request for `original`: endpoints swapped, same amount,
    /// key derived from the original id so repeated reversals collapse into one.
    pub(crate) fn reversal(original: &Transfer, reason: &str) -> Self {
        Self {
            from_user_id: original.to_user_id,
            to_user_id: original.from_user_id,
            amount: original.amount,
            idempotency_key: reversal_key(original.id),
            note: Some(reason.to_string()),
            reversal_of: Some(original.id),
        }
    }

    pub fn reversal_of(&self) -> Option<TransferId> {
        self.reversal_of
    }
}

/// Idempotency key of the compensating transfer for `transfer_id`
pub fn reversal_key(transfer_id: TransferId) -> String {
    format!("{}{}", REVERSAL_KEY_PREFIX, transfer_id)
}

/// Transfer row as persisted by the store
///
/// Never deleted; mutated only through status transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub amount: Points,
    pub status: TransferStatus,
    pub idempotency_key: String,
    pub note: Option<String>,
    /// Original transfer this one compensates
    pub reversal_of: Option<TransferId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only once the transfer completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only when status is `failed`
    pub fail_reason: Option<FailReason>,
}

impl Transfer {
    /// Whether `request` describes the same logical transfer as this row
    pub fn matches(&self, request: &TransferRequest) -> bool {
        self.from_user_id == request.from_user_id
            && self.to_user_id == request.to_user_id
            && self.amount == request.amount
            && self.reversal_of == request.reversal_of
    }

    pub fn is_reversal(&self) -> bool {
        self.reversal_of.is_some()
    }

    /// Interpret a settled row as a caller-facing result.
    ///
    /// `completed` and `reversed` are successes; `failed` and `cancelled` map to
    /// the error a caller would act on.
    pub fn outcome(&self) -> Result<&Transfer, TransferError> {
        match self.status {
            TransferStatus::Completed | TransferStatus::Reversed => Ok(self),
            TransferStatus::Failed => match self.fail_reason {
                Some(FailReason::InsufficientFunds) => Err(TransferError::InsufficientFunds {
                    transfer_id: Some(self.id),
                    user_id: self.from_user_id,
                    requested: self.amount,
                }),
                Some(FailReason::InvariantViolation) => Err(TransferError::InvariantViolation {
                    user_id: None,
                    message: format!("transfer {} failed on a ledger invariant", self.id),
                }),
                reason => Err(TransferError::StoreUnavailable {
                    message: format!(
                        "transfer {} failed: {}",
                        self.id,
                        reason.map_or("unknown", |r| r.as_str())
                    ),
                    transfer_id: Some(self.id),
                }),
            },
            TransferStatus::Cancelled => Err(TransferError::Cancelled(self.id)),
            TransferStatus::Pending | TransferStatus::Processing => {
                Err(TransferError::DuplicateInFlight {
                    idempotency_key: self.idempotency_key.clone(),
                    transfer_id: self.id,
                })
            }
        }
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] {} -> {} amount={} status={}",
            self.id, self.from_user_id, self.to_user_id, self.amount, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::error::ErrorKind;

    fn sample(status: TransferStatus, fail_reason: Option<FailReason>) -> Transfer {
        let now = Utc::now();
        Transfer {
            id: 7,
            from_user_id: 1,
            to_user_id: 2,
            amount: 100,
            status,
            idempotency_key: "k-7".to_string(),
            note: None,
            reversal_of: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            fail_reason,
        }
    }

    #[test]
    fn test_reversal_request_swaps_endpoints() {
        let original = sample(TransferStatus::Completed, None);
        let req = TransferRequest::reversal(&original, "chargeback");

        assert_eq!(req.from_user_id, 2);
        assert_eq!(req.to_user_id, 1);
        assert_eq!(req.amount, 100);
        assert_eq!(req.idempotency_key, "reversal:7");
        assert_eq!(req.note.as_deref(), Some("chargeback"));
        assert_eq!(req.reversal_of(), Some(7));
    }

    #[test]
    fn test_matches_ignores_note() {
        let transfer = sample(TransferStatus::Completed, None);
        let req = TransferRequest::new(1, 2, 100, "k-7").with_note("different");
        assert!(transfer.matches(&req));
        assert!(!transfer.matches(&TransferRequest::new(1, 2, 101, "k-7")));
    }

    #[test]
    fn test_outcome_mapping() {
        assert!(sample(TransferStatus::Completed, None).outcome().is_ok());
        assert!(sample(TransferStatus::Reversed, None).outcome().is_ok());

        let err = sample(TransferStatus::Failed, Some(FailReason::InsufficientFunds))
            .outcome()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert!(!err.is_retryable());

        let err = sample(TransferStatus::Failed, Some(FailReason::StoreUnavailable))
            .outcome()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(err.is_retryable());
        assert!(!err.key_reusable());

        let err = sample(TransferStatus::Cancelled, None).outcome().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_fail_reason_strings() {
        assert_eq!(FailReason::InsufficientFunds.to_string(), "insufficient_funds");
        assert_eq!(
            "abandoned".parse::<FailReason>(),
            Ok(FailReason::Abandoned)
        );
        assert!("nope".parse::<FailReason>().is_err());
    }
}

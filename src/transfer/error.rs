//! Transfer Error Types
//!
//! Every error maps to a stable [`ErrorKind`] and machine code, and says whether
//! a caller may retry and whether the same idempotency key may be reused.

use thiserror::Error;

use super::state::TransferStatus;
use crate::core_types::{Points, TransferId, UserId};
use crate::store::StoreError;

/// Coarse error classes exposed to the service layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; no state was created
    Validation,
    /// Unknown user or transfer
    NotFound,
    /// Concurrent or state conflict on an existing row
    Conflict,
    /// Source balance too low; the transfer row is `failed`
    InsufficientFunds,
    /// Store failed; everything inside the atomic unit was rolled back
    StoreUnavailable,
    /// Ledger/balance mismatch; needs operator reconciliation
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorKind::InvariantViolation => "INVARIANT_VIOLATION",
        }
    }
}

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Amount exceeds the per-transfer maximum of {0}")]
    AmountTooLarge(Points),

    #[error("Source and destination user cannot be the same")]
    SameAccount,

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("Note exceeds {0} bytes")]
    NoteTooLong(usize),

    #[error("Invalid adjustment: {0}")]
    InvalidAdjustment(String),

    #[error("Invalid reversal reason: {0}")]
    InvalidReason(String),

    // === Lookup Errors ===
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // === State Errors ===
    #[error("Transfer {transfer_id} is {status} and cannot be {action}")]
    InvalidState {
        transfer_id: TransferId,
        status: TransferStatus,
        action: &'static str,
    },

    #[error("Transfer {transfer_id} already committed (status {status})")]
    AlreadyCommitted {
        transfer_id: TransferId,
        status: TransferStatus,
    },

    #[error("Transfer {0} was cancelled")]
    Cancelled(TransferId),

    #[error("Transfer {transfer_id} for key {idempotency_key} is still in flight")]
    DuplicateInFlight {
        idempotency_key: String,
        transfer_id: TransferId,
    },

    #[error(
        "Reversal of transfer {transfer_id} failed: compensating transfer {compensating_id} ended {status}"
    )]
    ReversalFailed {
        transfer_id: TransferId,
        compensating_id: TransferId,
        status: TransferStatus,
        insufficient_funds: bool,
    },

    // === Balance Errors ===
    #[error("Insufficient balance for user {user_id} (requested {requested})")]
    InsufficientFunds {
        transfer_id: Option<TransferId>,
        user_id: UserId,
        requested: Points,
    },

    // === System Errors ===
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        /// Row left behind (in `failed`) when the failure happened after creation
        transfer_id: Option<TransferId>,
    },

    #[error("Ledger invariant violated: {message}")]
    InvariantViolation {
        user_id: Option<UserId>,
        message: String,
    },
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidAmount
            | TransferError::AmountTooLarge(_)
            | TransferError::SameAccount
            | TransferError::InvalidIdempotencyKey(_)
            | TransferError::NoteTooLong(_)
            | TransferError::InvalidAdjustment(_)
            | TransferError::InvalidReason(_) => ErrorKind::Validation,
            TransferError::UserNotFound(_) | TransferError::TransferNotFound(_) => {
                ErrorKind::NotFound
            }
            TransferError::InvalidState { .. }
            | TransferError::AlreadyCommitted { .. }
            | TransferError::Cancelled(_)
            | TransferError::DuplicateInFlight { .. } => ErrorKind::Conflict,
            TransferError::ReversalFailed {
                insufficient_funds, ..
            } => {
                if *insufficient_funds {
                    ErrorKind::InsufficientFunds
                } else {
                    ErrorKind::StoreUnavailable
                }
            }
            TransferError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            TransferError::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            TransferError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
        }
    }

    /// Stable machine code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::AmountTooLarge(_) => "AMOUNT_TOO_LARGE",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidIdempotencyKey(_) => "INVALID_IDEMPOTENCY_KEY",
            TransferError::NoteTooLong(_) => "NOTE_TOO_LONG",
            TransferError::InvalidAdjustment(_) => "INVALID_ADJUSTMENT",
            TransferError::InvalidReason(_) => "INVALID_REASON",
            TransferError::UserNotFound(_) => "USER_NOT_FOUND",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::InvalidState { .. } => "INVALID_STATE",
            TransferError::AlreadyCommitted { .. } => "ALREADY_COMMITTED",
            TransferError::Cancelled(_) => "CANCELLED",
            TransferError::DuplicateInFlight { .. } => "DUPLICATE_IN_FLIGHT",
            TransferError::ReversalFailed { .. } => "REVERSAL_FAILED",
            TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransferError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            TransferError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InsufficientFunds => 422,
            ErrorKind::StoreUnavailable => 503,
            ErrorKind::InvariantViolation => 500,
        }
    }

    /// Whether trying the operation again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::StoreUnavailable { .. }
                | TransferError::DuplicateInFlight { .. }
                | TransferError::ReversalFailed {
                    insufficient_funds: false,
                    ..
                }
        )
    }

    /// Whether a retry may reuse the same idempotency key.
    ///
    /// False once a row exists for the key in a settled state: resubmitting it
    /// would only replay that outcome.
    pub fn key_reusable(&self) -> bool {
        matches!(
            self,
            TransferError::StoreUnavailable {
                transfer_id: None,
                ..
            } | TransferError::DuplicateInFlight { .. }
        )
    }

    /// Transfer row the error refers to, when one exists
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            TransferError::InvalidState { transfer_id, .. }
            | TransferError::AlreadyCommitted { transfer_id, .. }
            | TransferError::DuplicateInFlight { transfer_id, .. }
            | TransferError::ReversalFailed { transfer_id, .. } => Some(*transfer_id),
            TransferError::Cancelled(transfer_id) => Some(*transfer_id),
            TransferError::InsufficientFunds { transfer_id, .. }
            | TransferError::StoreUnavailable { transfer_id, .. } => *transfer_id,
            _ => None,
        }
    }

    pub(crate) fn invariant(user_id: Option<UserId>, message: impl Into<String>) -> Self {
        TransferError::InvariantViolation {
            user_id,
            message: message.into(),
        }
    }

    /// Attach the transfer row a store failure left behind
    pub(crate) fn with_transfer(self, id: TransferId) -> Self {
        match self {
            TransferError::StoreUnavailable { message, .. } => TransferError::StoreUnavailable {
                message,
                transfer_id: Some(id),
            },
            other => other,
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UserNotFound(id) => TransferError::UserNotFound(id),
            StoreError::TransferNotFound(id) => TransferError::TransferNotFound(id.to_string()),
            StoreError::Corrupt(msg) => TransferError::invariant(None, msg),
            StoreError::Constraint(msg) => TransferError::invariant(None, msg),
            other => TransferError::StoreUnavailable {
                message: other.to_string(),
                transfer_id: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferError::SameAccount.code(), "SAME_ACCOUNT");
        assert_eq!(TransferError::InvalidAmount.code(), "INVALID_AMOUNT");
        assert_eq!(TransferError::UserNotFound(1).code(), "USER_NOT_FOUND");
    }

    #[test]
    fn test_kinds_and_http_status() {
        assert_eq!(TransferError::InvalidAmount.kind(), ErrorKind::Validation);
        assert_eq!(TransferError::InvalidAmount.http_status(), 400);
        assert_eq!(TransferError::UserNotFound(9).http_status(), 404);
        assert_eq!(
            TransferError::AlreadyCommitted {
                transfer_id: 1,
                status: TransferStatus::Completed
            }
            .http_status(),
            409
        );
        assert_eq!(
            TransferError::invariant(Some(1), "mismatch").http_status(),
            500
        );
    }

    #[test]
    fn test_retry_semantics() {
        let before_row = TransferError::StoreUnavailable {
            message: "down".into(),
            transfer_id: None,
        };
        assert!(before_row.is_retryable());
        assert!(before_row.key_reusable());

        let after_row = before_row.clone().with_transfer(5);
        assert!(after_row.is_retryable());
        assert!(!after_row.key_reusable());
        assert_eq!(before_row.transfer_id(), None);
        assert_eq!(after_row.transfer_id(), Some(5));

        let fatal = TransferError::invariant(Some(1), "mismatch");
        assert!(!fatal.is_retryable());
        assert!(!TransferError::InvalidAmount.is_retryable());
    }

    #[test]
    fn test_from_store_error() {
        let err: TransferError = StoreError::Unavailable("pool timed out".into()).into();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(err.key_reusable());

        let err: TransferError = StoreError::UserNotFound(3).into();
        assert_eq!(err, TransferError::UserNotFound(3));

        let err: TransferError = StoreError::Corrupt("bad status".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[test]
    fn test_display() {
        let err = TransferError::InsufficientFunds {
            transfer_id: Some(1),
            user_id: 4,
            requested: 400,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance for user 4 (requested 400)"
        );
    }
}

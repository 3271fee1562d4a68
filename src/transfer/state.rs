//! Transfer FSM State Definitions
//!
//! ```text
//! PENDING → PROCESSING → COMPLETED → REVERSED
//!    │          │  ╲
//!    │          │   ╲→ FAILED
//!    ╰──────────┴─────→ CANCELLED
//! ```
//!
//! `PENDING → FAILED` exists for rows stranded before processing started.
//! Nothing ever moves backward; `COMPLETED → REVERSED` is the only edge out of
//! a settled state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transfer lifecycle states
///
/// Stored as lowercase text so the store's CHECK constraint reads the same
/// values the API layer serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Row created, idempotency key claimed
    Pending,

    /// Claimed by an engine; the atomic unit may be running
    Processing,

    /// Balance mutation and ledger entries committed
    Completed,

    /// Terminal: no balance effect (see `fail_reason`)
    Failed,

    /// Terminal: aborted by the caller before the balance mutation committed
    Cancelled,

    /// Terminal: a compensating transfer undid this one
    Reversed,
}

impl TransferStatus {
    /// Settled states: a submission returns once one of these is reached.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Cancelled
                | TransferStatus::Reversed
        )
    }

    /// States a caller-initiated cancel may still act on
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Processing)
    }

    /// Whether `self → next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (*self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Completed, Reversed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Reversed => "reversed",
        }
    }

    pub const ALL: [TransferStatus; 6] = [
        TransferStatus::Pending,
        TransferStatus::Processing,
        TransferStatus::Completed,
        TransferStatus::Failed,
        TransferStatus::Cancelled,
        TransferStatus::Reversed,
    ];
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown transfer status: {}", s))
    }
}

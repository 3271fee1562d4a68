//! Points transfers
//!
//! Moves points between two accounts with idempotent submission, an
//! all-or-nothing balance mutation and an auditable lifecycle.
//!
//! # State Machine
//!
//! ```text
//! PENDING → PROCESSING → COMPLETED → REVERSED
//!    │           │
//!    │           └──────→ FAILED
//!    └───→ CANCELLED ←───┘ (before the atomic unit commits)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Mutate**: the row (and its idempotency key) exists in
//!    `pending` before any balance is touched
//! 2. **One Atomic Unit**: debit, credit, both ledger legs and `completed`
//!    commit together or not at all
//! 3. **Global Lock Order**: transfer row first, then accounts ascending
//! 4. **Halt On Mismatch**: a ledger/balance disagreement quarantines the
//!    accounts involved until an operator releases them

pub mod engine;
pub mod error;
pub mod reversal;
pub mod state;
pub mod types;
pub mod worker;

pub use engine::{Adjustment, TransferEngine};
pub use error::{ErrorKind, TransferError};
pub use state::TransferStatus;
pub use types::{
    FailReason, MAX_TRANSFER_AMOUNT, REVERSAL_KEY_PREFIX, Transfer, TransferRequest, reversal_key,
};
pub use worker::{RecoveryWorker, WorkerConfig};

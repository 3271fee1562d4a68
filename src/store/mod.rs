//! Storage seam
//!
//! The engine is written against [`PointsStore`] and [`AtomicUnit`]; the store
//! owns account balances, transfer rows and the ledger table, and provides the
//! transactional boundary that makes "debit + credit + two ledger appends +
//! status transition" all-or-nothing.
//!
//! # Locking model
//!
//! [`PointsStore::begin`] locks everything named in the [`UnitScope`] before it
//! returns: the transfer row first, then account rows in ascending id order.
//! Every unit takes its locks in that same global order, so units never
//! deadlock. Units with disjoint scopes run in parallel.
//!
//! Single-statement writes outside a unit ([`PointsStore::update_status`]) wait
//! on the transfer's row lock like any other writer.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core_types::{LedgerEntryId, Points, TransferId, UserId};
use crate::ledger::{LedgerEntry, NewLedgerEntry};
use crate::transfer::{FailReason, Transfer, TransferRequest, TransferStatus};

/// Store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("user not found: {0}")]
    UserNotFound(UserId),

    #[error("transfer not found: {0}")]
    TransferNotFound(TransferId),

    /// A CHECK/unique constraint rejected a write the engine believed valid
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A persisted row could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("atomic unit already finished")]
    UnitFinished,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.code().is_some_and(|c| c.starts_with("23")) => {
                StoreError::Constraint(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Rows an atomic unit locks up front
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitScope {
    pub transfer_id: Option<TransferId>,
    pub accounts: Vec<UserId>,
}

impl UnitScope {
    /// A transfer row plus the accounts it moves points between
    pub fn transfer(transfer_id: TransferId, accounts: [UserId; 2]) -> Self {
        Self {
            transfer_id: Some(transfer_id),
            accounts: accounts.to_vec(),
        }
    }

    /// Only the transfer row (cancel, reversal marking, recovery)
    pub fn transfer_row(transfer_id: TransferId) -> Self {
        Self {
            transfer_id: Some(transfer_id),
            accounts: Vec::new(),
        }
    }

    pub fn accounts(accounts: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            transfer_id: None,
            accounts: accounts.into_iter().collect(),
        }
    }

    /// Accounts in lock order: ascending, deduplicated
    pub fn lock_order(&self) -> Vec<UserId> {
        let mut ids = self.accounts.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn covers_account(&self, user_id: UserId) -> bool {
        self.accounts.contains(&user_id)
    }
}

/// Status write applied as a compare-and-swap on the current status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: TransferStatus,
    pub fail_reason: Option<FailReason>,
}

impl StatusUpdate {
    pub fn to(status: TransferStatus) -> Self {
        Self {
            status,
            fail_reason: None,
        }
    }

    pub fn failed(reason: FailReason) -> Self {
        Self {
            status: TransferStatus::Failed,
            fail_reason: Some(reason),
        }
    }

    /// Reject edges the state machine does not allow
    pub fn check_edge(&self, expected: TransferStatus) -> Result<(), StoreError> {
        if expected.can_transition_to(self.status) {
            Ok(())
        } else {
            Err(StoreError::Constraint(format!(
                "illegal transfer transition {} -> {}",
                expected, self.status
            )))
        }
    }

    /// Row after the update: stamps `updated_at`, and `completed_at` on completion
    pub fn apply(&self, row: &Transfer, now: DateTime<Utc>) -> Transfer {
        let mut next = row.clone();
        next.status = self.status;
        next.updated_at = now;
        if self.status == TransferStatus::Completed {
            next.completed_at = Some(now);
        }
        if self.status == TransferStatus::Failed {
            next.fail_reason = self.fail_reason;
        }
        next
    }
}

/// Result of claiming an idempotency key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New row in `pending`
    Created(Transfer),
    /// The key was already taken; this is the existing row
    Existing(Transfer),
}

/// One transactional unit of work.
///
/// Dropping a unit without calling [`AtomicUnit::commit`] discards every write
/// made through it.
#[async_trait]
pub trait AtomicUnit: Send {
    /// Balance as seen inside this unit, including its own uncommitted deltas
    async fn balance(&mut self, user_id: UserId) -> Result<Points, StoreError>;

    /// Apply a signed delta to an account in scope; returns the new balance
    async fn apply_delta(&mut self, user_id: UserId, delta: Points) -> Result<Points, StoreError>;

    /// Append ledger entries; ids and timestamps are assigned here
    async fn append_entries(
        &mut self,
        entries: &[NewLedgerEntry],
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Read the locked transfer row
    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    /// CAS the transfer status. `None` when the current status is not `expected`.
    async fn update_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transfer>, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Durable store for balances, transfers and the ledger
#[async_trait]
pub trait PointsStore: Send + Sync {
    /// Check store connectivity
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Open a unit holding the locks named in `scope`
    async fn begin(&self, scope: &UnitScope) -> Result<Box<dyn AtomicUnit>, StoreError>;

    /// Committed balance of a user
    async fn get_balance(&self, user_id: UserId) -> Result<Points, StoreError>;

    async fn user_exists(&self, user_id: UserId) -> Result<bool, StoreError>;

    /// Create a `pending` row, claiming the idempotency key atomically
    async fn insert_transfer(&self, request: &TransferRequest)
    -> Result<InsertOutcome, StoreError>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    async fn get_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, StoreError>;

    /// Single-statement status CAS outside any unit
    async fn update_status(
        &self,
        id: TransferId,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transfer>, StoreError>;

    /// Newest committed ledger entry id for a user
    async fn latest_entry_id(&self, user_id: UserId) -> Result<Option<LedgerEntryId>, StoreError>;

    /// Page of a user's entries with `after < id <= up_to`, ascending
    async fn ledger_page(
        &self,
        user_id: UserId,
        after: Option<LedgerEntryId>,
        up_to: LedgerEntryId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Entries back-referencing a transfer, ascending
    async fn entries_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Pending/processing rows not updated since `older_than`, oldest first
    async fn list_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transfer>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order_sorted_and_deduped() {
        let scope = UnitScope::accounts([9, 3, 9, 1]);
        assert_eq!(scope.lock_order(), vec![1, 3, 9]);
        assert!(scope.covers_account(3));
        assert!(!scope.covers_account(4));
    }

    #[test]
    fn test_status_update_stamps() {
        let now = Utc::now();
        let row = Transfer {
            id: 1,
            from_user_id: 1,
            to_user_id: 2,
            amount: 10,
            status: TransferStatus::Processing,
            idempotency_key: "k".into(),
            note: None,
            reversal_of: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            fail_reason: None,
        };
        let later = now + chrono::Duration::seconds(1);

        let done = StatusUpdate::to(TransferStatus::Completed).apply(&row, later);
        assert_eq!(done.completed_at, Some(later));
        assert_eq!(done.updated_at, later);
        assert!(done.fail_reason.is_none());

        assert!(StatusUpdate::to(TransferStatus::Pending)
            .check_edge(TransferStatus::Completed)
            .is_err());

        let failed = StatusUpdate::failed(FailReason::InsufficientFunds).apply(&row, later);
        assert_eq!(failed.status, TransferStatus::Failed);
        assert_eq!(failed.fail_reason, Some(FailReason::InsufficientFunds));
        assert!(failed.completed_at.is_none());
    }
}

//! In-process transactional store
//!
//! Row locks are per-key `tokio` mutexes; a unit buffers its writes and
//! publishes them under one short critical section on commit, so readers see
//! either none or all of a unit's effects. Ledger ids come from a sequence
//! reserved at append time, like a database sequence: rolled-back units leave
//! gaps, and per-account order follows the account's lock order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{AtomicUnit, InsertOutcome, PointsStore, StatusUpdate, StoreError, UnitScope};
use crate::core_types::{LedgerEntryId, Points, TransferId, UserId};
use crate::ledger::{LedgerEntry, NewLedgerEntry};
use crate::transfer::{Transfer, TransferRequest, TransferStatus};

/// Row lock identity. Ordering matches the global lock order: transfers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum LockKey {
    Transfer(TransferId),
    Account(UserId),
}

type LockRows = DashMap<LockKey, Arc<tokio::sync::Mutex<()>>>;

#[derive(Default)]
struct LockTable {
    rows: Arc<LockRows>,
}

impl LockTable {
    async fn acquire(&self, key: LockKey) -> RowLock {
        let lock = self.rows.entry(key).or_default().clone();
        RowLock {
            key,
            guard: Some(lock.lock_owned().await),
            rows: self.rows.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Held row lock; the table entry is dropped once nobody holds or waits on it
struct RowLock {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    rows: Arc<LockRows>,
}

impl Drop for RowLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters clone the Arc under the shard lock, so a count of 1 is stable here
        self.rows
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Injected failures for exercising rollback paths
#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    failing_commits: AtomicUsize,
    failing_status_updates: AtomicUsize,
}

impl Faults {
    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn take_commit_failure(&self) -> bool {
        take_one(&self.failing_commits)
    }

    fn check_status_update(&self) -> Result<(), StoreError> {
        self.check()?;
        if take_one(&self.failing_status_updates) {
            return Err(StoreError::Unavailable(
                "injected status update failure".to_string(),
            ));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
struct MemoryState {
    balances: HashMap<UserId, Points>,
    transfers: BTreeMap<TransferId, Transfer>,
    keys: HashMap<String, TransferId>,
    ledger: BTreeMap<LedgerEntryId, LedgerEntry>,
    next_transfer_id: TransferId,
}

struct Shared {
    state: Mutex<MemoryState>,
    locks: LockTable,
    faults: Faults,
    next_entry_id: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`PointsStore`]
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState {
                    next_transfer_id: 1,
                    ..Default::default()
                }),
                locks: LockTable::default(),
                faults: Faults::default(),
                next_entry_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an account with a zero balance. Returns false if it already exists.
    ///
    /// Accounts start empty so their ledger history accounts for every point.
    pub fn insert_user(&self, user_id: UserId) -> bool {
        let mut state = self.shared.state();
        if state.balances.contains_key(&user_id) {
            return false;
        }
        state.balances.insert(user_id, 0);
        true
    }

    /// Make every operation fail with `Unavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared
            .faults
            .unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` unit commits (the unit's writes are discarded)
    pub fn fail_next_commits(&self, n: usize) {
        self.shared.faults.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` autocommit status updates
    pub fn fail_next_status_updates(&self, n: usize) {
        self.shared
            .faults
            .failing_status_updates
            .store(n, Ordering::SeqCst);
    }

    pub fn transfer_count(&self) -> usize {
        self.shared.state().transfers.len()
    }

    pub fn entry_count(&self) -> usize {
        self.shared.state().ledger.len()
    }
}

#[async_trait]
impl PointsStore for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.shared.faults.check()
    }

    async fn begin(&self, scope: &UnitScope) -> Result<Box<dyn AtomicUnit>, StoreError> {
        self.shared.faults.check()?;

        let mut guards = Vec::with_capacity(scope.accounts.len() + 1);
        if let Some(id) = scope.transfer_id {
            guards.push(self.shared.locks.acquire(LockKey::Transfer(id)).await);
        }
        let accounts = scope.lock_order();
        for user_id in &accounts {
            guards.push(self.shared.locks.acquire(LockKey::Account(*user_id)).await);
        }

        // Snapshot the locked rows; nobody else can write them until we release
        let (balances, transfer) = {
            let state = self.shared.state();
            let mut balances = HashMap::with_capacity(accounts.len());
            for user_id in &accounts {
                let balance = state
                    .balances
                    .get(user_id)
                    .copied()
                    .ok_or(StoreError::UserNotFound(*user_id))?;
                balances.insert(*user_id, balance);
            }
            let transfer = scope
                .transfer_id
                .and_then(|id| state.transfers.get(&id).cloned());
            (balances, transfer)
        };

        debug!(?scope, "memory unit opened");
        Ok(Box::new(MemoryUnit {
            shared: self.shared.clone(),
            scope: scope.clone(),
            guards,
            balances,
            transfer,
            transfer_dirty: false,
            entries: Vec::new(),
            finished: false,
        }))
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Points, StoreError> {
        self.shared.faults.check()?;
        self.shared
            .state()
            .balances
            .get(&user_id)
            .copied()
            .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn user_exists(&self, user_id: UserId) -> Result<bool, StoreError> {
        self.shared.faults.check()?;
        Ok(self.shared.state().balances.contains_key(&user_id))
    }

    async fn insert_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<InsertOutcome, StoreError> {
        self.shared.faults.check()?;
        let mut state = self.shared.state();

        if let Some(existing) = state
            .keys
            .get(&request.idempotency_key)
            .and_then(|id| state.transfers.get(id))
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let id = state.next_transfer_id;
        state.next_transfer_id += 1;
        let now = Utc::now();
        let transfer = Transfer {
            id,
            from_user_id: request.from_user_id,
            to_user_id: request.to_user_id,
            amount: request.amount,
            status: TransferStatus::Pending,
            idempotency_key: request.idempotency_key.clone(),
            note: request.note.clone(),
            reversal_of: request.reversal_of,
            created_at: now,
            updated_at: now,
            completed_at: None,
            fail_reason: None,
        };
        state.keys.insert(transfer.idempotency_key.clone(), id);
        state.transfers.insert(id, transfer.clone());
        Ok(InsertOutcome::Created(transfer))
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        self.shared.faults.check()?;
        Ok(self.shared.state().transfers.get(&id).cloned())
    }

    async fn get_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, StoreError> {
        self.shared.faults.check()?;
        let state = self.shared.state();
        Ok(state
            .keys
            .get(key)
            .and_then(|id| state.transfers.get(id))
            .cloned())
    }

    async fn update_status(
        &self,
        id: TransferId,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transfer>, StoreError> {
        self.shared.faults.check_status_update()?;
        update.check_edge(expected)?;
        let _row_lock = self.shared.locks.acquire(LockKey::Transfer(id)).await;

        let mut state = self.shared.state();
        let row = state
            .transfers
            .get_mut(&id)
            .ok_or(StoreError::TransferNotFound(id))?;
        if row.status != expected {
            return Ok(None);
        }
        *row = update.apply(row, Utc::now());
        Ok(Some(row.clone()))
    }

    async fn latest_entry_id(&self, user_id: UserId) -> Result<Option<LedgerEntryId>, StoreError> {
        self.shared.faults.check()?;
        Ok(self
            .shared
            .state()
            .ledger
            .values()
            .rev()
            .find(|entry| entry.user_id == user_id)
            .map(|entry| entry.id))
    }

    async fn ledger_page(
        &self,
        user_id: UserId,
        after: Option<LedgerEntryId>,
        up_to: LedgerEntryId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.shared.faults.check()?;
        let start = after.map_or(0, |id| id.saturating_add(1));
        if start > up_to {
            return Ok(Vec::new());
        }
        Ok(self
            .shared
            .state()
            .ledger
            .range(start..=up_to)
            .map(|(_, entry)| entry)
            .filter(|entry| entry.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn entries_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.shared.faults.check()?;
        Ok(self
            .shared
            .state()
            .ledger
            .values()
            .filter(|entry| entry.transfer_id == Some(transfer_id))
            .cloned()
            .collect())
    }

    async fn list_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.shared.faults.check()?;
        let mut stale: Vec<Transfer> = self
            .shared
            .state()
            .transfers
            .values()
            .filter(|t| !t.status.is_terminal() && t.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }
}

struct MemoryUnit {
    shared: Arc<Shared>,
    scope: UnitScope,
    guards: Vec<RowLock>,
    /// Working balances of the locked accounts
    balances: HashMap<UserId, Points>,
    /// Working copy of the locked transfer row
    transfer: Option<Transfer>,
    transfer_dirty: bool,
    entries: Vec<LedgerEntry>,
    finished: bool,
}

impl MemoryUnit {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::UnitFinished);
        }
        self.shared.faults.check()
    }

    fn release(&mut self) {
        self.finished = true;
        self.guards.clear();
    }
}

#[async_trait]
impl AtomicUnit for MemoryUnit {
    async fn balance(&mut self, user_id: UserId) -> Result<Points, StoreError> {
        self.ensure_open()?;
        if let Some(balance) = self.balances.get(&user_id) {
            return Ok(*balance);
        }
        self.shared
            .state()
            .balances
            .get(&user_id)
            .copied()
            .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn apply_delta(&mut self, user_id: UserId, delta: Points) -> Result<Points, StoreError> {
        self.ensure_open()?;
        let balance = self.balances.get_mut(&user_id).ok_or_else(|| {
            StoreError::Constraint(format!("account {} is not locked by this unit", user_id))
        })?;
        let next = balance
            .checked_add(delta)
            .filter(|next| *next >= 0)
            .ok_or_else(|| {
                StoreError::Constraint(format!(
                    "points_balance >= 0 violated for user {} (balance {}, delta {})",
                    user_id, balance, delta
                ))
            })?;
        *balance = next;
        Ok(next)
    }

    async fn append_entries(
        &mut self,
        entries: &[NewLedgerEntry],
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.ensure_open()?;
        if let Some(entry) = entries.iter().find(|e| !self.scope.covers_account(e.user_id)) {
            return Err(StoreError::Constraint(format!(
                "ledger entry for user {} outside unit scope",
                entry.user_id
            )));
        }
        let now = Utc::now();
        let written: Vec<LedgerEntry> = entries
            .iter()
            .cloned()
            .map(|entry| {
                let id = self.shared.next_entry_id.fetch_add(1, Ordering::SeqCst);
                entry.into_entry(id, now)
            })
            .collect();
        self.entries.extend(written.iter().cloned());
        Ok(written)
    }

    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        self.ensure_open()?;
        if self.scope.transfer_id == Some(id) {
            return Ok(self.transfer.clone());
        }
        Ok(self.shared.state().transfers.get(&id).cloned())
    }

    async fn update_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transfer>, StoreError> {
        self.ensure_open()?;
        update.check_edge(expected)?;
        if self.scope.transfer_id != Some(id) {
            return Err(StoreError::Constraint(format!(
                "transfer {} is not locked by this unit",
                id
            )));
        }
        let row = self
            .transfer
            .as_mut()
            .ok_or(StoreError::TransferNotFound(id))?;
        if row.status != expected {
            return Ok(None);
        }
        *row = update.apply(row, Utc::now());
        self.transfer_dirty = true;
        Ok(Some(row.clone()))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.shared.faults.take_commit_failure() {
            self.release();
            return Err(StoreError::Unavailable(
                "commit failed (injected)".to_string(),
            ));
        }

        {
            let mut state = self.shared.state();
            for (user_id, balance) in self.balances.drain() {
                state.balances.insert(user_id, balance);
            }
            if self.transfer_dirty
                && let Some(row) = self.transfer.take()
            {
                state.transfers.insert(row.id, row);
            }
            for entry in self.entries.drain(..) {
                state.ledger.insert(entry.id, entry);
            }
        }

        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::UnitFinished);
        }
        self.release();
        Ok(())
    }
}

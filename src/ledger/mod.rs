//! Ledger - append-only balance audit log
//!
//! Every balance change is recorded as one entry carrying the resulting
//! balance. Entries are written only inside the atomic unit that applies the
//! matching deltas, and [`Ledger::append`] refuses any batch whose
//! `balance_after` chain disagrees with the balances the unit actually holds.

pub mod entry;
pub mod history;

pub use entry::{EventType, LedgerEntry, NewLedgerEntry};
pub use history::LedgerHistory;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

use crate::core_types::{Points, TransferId, UserId};
use crate::store::{AtomicUnit, PointsStore, UnitScope};
use crate::transfer::TransferError;

/// Default number of entries fetched per history page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Result of replaying an account's history against its balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub user_id: UserId,
    pub entries: usize,
    /// Sum of every `change`
    pub ledger_total: Points,
    pub balance: Points,
}

/// Check a batch against the balances its unit started from.
///
/// Returns the closing balance per account. Any inconsistency is an
/// invariant violation: batches are built by the engine, never by callers.
pub fn validate_batch(
    opening: &HashMap<UserId, Points>,
    entries: &[NewLedgerEntry],
) -> Result<HashMap<UserId, Points>, TransferError> {
    if entries.is_empty() {
        return Err(TransferError::invariant(None, "empty ledger batch"));
    }

    let mut legs: BTreeMap<TransferId, Vec<&NewLedgerEntry>> = BTreeMap::new();
    let mut running: HashMap<UserId, Points> = HashMap::new();

    for entry in entries {
        let user = Some(entry.user_id);
        if entry.change == 0 {
            return Err(TransferError::invariant(user, "zero-change ledger entry"));
        }

        match entry.transfer_id {
            Some(transfer_id) => {
                if !(entry.event_type.is_debit_leg() || entry.event_type.is_credit_leg()) {
                    return Err(TransferError::invariant(
                        user,
                        format!(
                            "{} entry cannot reference transfer {}",
                            entry.event_type, transfer_id
                        ),
                    ));
                }
                legs.entry(transfer_id).or_default().push(entry);
            }
            None => {
                let sign_ok = entry.event_type.is_adjustment()
                    && match entry.event_type {
                        EventType::Earn => entry.change > 0,
                        EventType::Redeem => entry.change < 0,
                        _ => true,
                    };
                if !sign_ok {
                    return Err(TransferError::invariant(
                        user,
                        format!(
                            "{} entry with change {} is not a valid adjustment",
                            entry.event_type, entry.change
                        ),
                    ));
                }
            }
        }

        let start = match running.get(&entry.user_id) {
            Some(balance) => *balance,
            None => *opening.get(&entry.user_id).ok_or_else(|| {
                TransferError::invariant(user, "no opening balance for ledger entry")
            })?,
        };
        let expected = start
            .checked_add(entry.change)
            .ok_or_else(|| TransferError::invariant(user, "balance overflow"))?;
        if expected != entry.balance_after {
            return Err(TransferError::invariant(
                user,
                format!(
                    "balance_after {} does not match {} {:+}",
                    entry.balance_after, start, entry.change
                ),
            ));
        }
        if expected < 0 {
            return Err(TransferError::invariant(user, "negative balance_after"));
        }
        running.insert(entry.user_id, expected);
    }

    for (transfer_id, pair) in &legs {
        let [first, second] = pair.as_slice() else {
            return Err(TransferError::invariant(
                None,
                format!(
                    "transfer {} has {} ledger entries in one batch, expected 2",
                    transfer_id,
                    pair.len()
                ),
            ));
        };
        let (debit, credit) = if first.event_type.is_debit_leg() {
            (first, second)
        } else {
            (second, first)
        };
        let paired_types = matches!(
            (debit.event_type, credit.event_type),
            (EventType::TransferOut, EventType::TransferIn)
                | (EventType::ReversalOut, EventType::ReversalIn)
        );
        if !paired_types
            || debit.change >= 0
            || debit.change.checked_add(credit.change) != Some(0)
            || debit.user_id == credit.user_id
        {
            return Err(TransferError::invariant(
                None,
                format!("transfer {} legs do not balance", transfer_id),
            ));
        }
    }

    Ok(running)
}

/// Ledger reads and the append-side invariant check
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn PointsStore>,
    page_size: usize,
}

impl Ledger {
    pub fn new(store: Arc<dyn PointsStore>) -> Self {
        Self::with_page_size(store, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: Arc<dyn PointsStore>, page_size: usize) -> Self {
        Self { store, page_size }
    }

    /// Append the full set of entries belonging to one atomic unit.
    ///
    /// `opening` holds each account's balance as read at the start of the
    /// unit; the unit must already hold the deltas the entries describe.
    pub async fn append(
        &self,
        unit: &mut dyn AtomicUnit,
        opening: &HashMap<UserId, Points>,
        entries: &[NewLedgerEntry],
    ) -> Result<Vec<LedgerEntry>, TransferError> {
        let closing = validate_batch(opening, entries)?;

        for (user_id, expected) in &closing {
            let actual = unit.balance(*user_id).await?;
            if actual != *expected {
                error!(
                    user_id,
                    expected, actual, "Ledger batch disagrees with account balance"
                );
                return Err(TransferError::invariant(
                    Some(*user_id),
                    format!(
                        "account balance {} but ledger implies {}",
                        actual, expected
                    ),
                ));
            }
        }

        let written = unit.append_entries(entries).await?;
        debug!(count = written.len(), "ledger entries appended");
        Ok(written)
    }

    /// Entries of `user_id`, oldest first
    pub fn history(&self, user_id: UserId) -> LedgerHistory {
        LedgerHistory::new(self.store.clone(), user_id, self.page_size)
    }

    /// Entries written for one transfer
    pub async fn entries_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, TransferError> {
        Ok(self.store.entries_for_transfer(transfer_id).await?)
    }

    /// Balance right after the last entry created at or before `at`
    pub async fn balance_as_of(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Points, TransferError> {
        let mut history = self.history(user_id);
        let mut balance = 0;
        while let Some(entry) = history.next().await? {
            if entry.created_at > at {
                break;
            }
            balance = entry.balance_after;
        }
        Ok(balance)
    }

    /// Replay an account's history and compare it with the stored balance.
    ///
    /// Holds the account's row lock while reading so no transfer can commit
    /// in between.
    pub async fn reconcile(&self, user_id: UserId) -> Result<Reconciliation, TransferError> {
        let mut unit = self.store.begin(&UnitScope::accounts([user_id])).await?;
        let result = self.replay(unit.as_mut(), user_id).await;
        if let Err(e) = unit.rollback().await {
            debug!(user_id, error = %e, "reconcile unit rollback failed");
        }
        result
    }

    async fn replay(
        &self,
        unit: &mut dyn AtomicUnit,
        user_id: UserId,
    ) -> Result<Reconciliation, TransferError> {
        let balance = unit.balance(user_id).await?;
        let mut history = self.history(user_id);
        let mut running: Points = 0;
        let mut entries = 0;

        while let Some(entry) = history.next().await? {
            running = running
                .checked_add(entry.change)
                .ok_or_else(|| TransferError::invariant(Some(user_id), "ledger sum overflow"))?;
            if running != entry.balance_after {
                return Err(TransferError::invariant(
                    Some(user_id),
                    format!(
                        "entry {} records balance_after {} but history sums to {}",
                        entry.id, entry.balance_after, running
                    ),
                ));
            }
            entries += 1;
        }

        if running != balance {
            return Err(TransferError::invariant(
                Some(user_id),
                format!("ledger sums to {} but balance is {}", running, balance),
            ));
        }

        Ok(Reconciliation {
            user_id,
            entries,
            ledger_total: running,
            balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transfer::ErrorKind;
    use futures::TryStreamExt;

    fn opening(pairs: &[(UserId, Points)]) -> HashMap<UserId, Points> {
        pairs.iter().copied().collect()
    }

    fn transfer_pair(from_after: Points, to_after: Points) -> Vec<NewLedgerEntry> {
        vec![
            NewLedgerEntry::transfer_leg(1, 10, -200, from_after, EventType::TransferOut),
            NewLedgerEntry::transfer_leg(1, 20, 200, to_after, EventType::TransferIn),
        ]
    }

    #[test]
    fn test_validate_transfer_pair() {
        let closing = validate_batch(&opening(&[(10, 500), (20, 0)]), &transfer_pair(300, 200))
            .unwrap();
        assert_eq!(closing[&10], 300);
        assert_eq!(closing[&20], 200);
    }

    #[test]
    fn test_validate_rejects_wrong_snapshot() {
        let err = validate_batch(&opening(&[(10, 500), (20, 0)]), &transfer_pair(301, 200))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[test]
    fn test_validate_rejects_single_transfer_leg() {
        let entries = vec![NewLedgerEntry::transfer_leg(
            1,
            10,
            -200,
            300,
            EventType::TransferOut,
        )];
        let err = validate_batch(&opening(&[(10, 500)]), &entries).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_validate_rejects_mixed_leg_types() {
        let entries = vec![
            NewLedgerEntry::transfer_leg(1, 10, -200, 300, EventType::TransferOut),
            NewLedgerEntry::transfer_leg(1, 20, 200, 200, EventType::ReversalIn),
        ];
        let err = validate_batch(&opening(&[(10, 500), (20, 0)]), &entries).unwrap_err();
        assert!(err.to_string().contains("do not balance"));
    }

    #[test]
    fn test_validate_adjustment_signs() {
        let earn = [NewLedgerEntry::adjustment(10, 50, 50, EventType::Earn)];
        assert!(validate_batch(&opening(&[(10, 0)]), &earn).is_ok());

        let bad_redeem = [NewLedgerEntry::adjustment(10, 50, 50, EventType::Redeem)];
        assert!(validate_batch(&opening(&[(10, 0)]), &bad_redeem).is_err());

        let overdraw = [NewLedgerEntry::adjustment(10, -60, -10, EventType::Adjust)];
        assert!(validate_batch(&opening(&[(10, 50)]), &overdraw).is_err());

        // Transfer leg types need a transfer id
        let orphan_leg = [NewLedgerEntry::adjustment(10, 5, 5, EventType::TransferIn)];
        assert!(validate_batch(&opening(&[(10, 0)]), &orphan_leg).is_err());

        assert!(validate_batch(&opening(&[]), &[]).is_err());
    }

    async fn earn(store: &MemoryStore, ledger: &Ledger, user: UserId, amount: Points) {
        let mut unit = store.begin(&UnitScope::accounts([user])).await.unwrap();
        let before = unit.balance(user).await.unwrap();
        let after = unit.apply_delta(user, amount).await.unwrap();
        ledger
            .append(
                unit.as_mut(),
                &opening(&[(user, before)]),
                &[NewLedgerEntry::adjustment(user, amount, after, EventType::Earn)],
            )
            .await
            .unwrap();
        unit.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_checks_unit_balance() {
        let store = MemoryStore::new();
        store.insert_user(1);
        let ledger = Ledger::new(Arc::new(store.clone()));

        let mut unit = store.begin(&UnitScope::accounts([1])).await.unwrap();
        // Entry claims +10 but the delta was never applied
        let err = ledger
            .append(
                unit.as_mut(),
                &opening(&[(1, 0)]),
                &[NewLedgerEntry::adjustment(1, 10, 10, EventType::Earn)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[tokio::test]
    async fn test_history_paging_and_restart() {
        let store = MemoryStore::new();
        store.insert_user(1);
        let ledger = Ledger::with_page_size(Arc::new(store.clone()), 2);
        for amount in [5, 6, 7, 8, 9] {
            earn(&store, &ledger, 1, amount).await;
        }

        let mut history = ledger.history(1);
        let all = history.collect_remaining().await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.change).collect::<Vec<_>>(),
            vec![5, 6, 7, 8, 9]
        );
        assert!(history.next().await.unwrap().is_none());

        // Written after the snapshot: not part of this sequence
        earn(&store, &ledger, 1, 100).await;
        history.restart();
        assert_eq!(history.collect_remaining().await.unwrap(), all);

        let streamed: Vec<LedgerEntry> = ledger.history(1).into_stream().try_collect().await.unwrap();
        assert_eq!(streamed.len(), 6);
    }

    #[tokio::test]
    async fn test_reconcile_and_balance_as_of() {
        let store = MemoryStore::new();
        store.insert_user(1);
        let ledger = Ledger::new(Arc::new(store.clone()));

        let before_any = Utc::now();
        earn(&store, &ledger, 1, 40).await;
        let middle = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        earn(&store, &ledger, 1, 2).await;

        let report = ledger.reconcile(1).await.unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.ledger_total, 42);
        assert_eq!(report.balance, 42);

        assert_eq!(ledger.balance_as_of(1, before_any).await.unwrap(), 0);
        assert_eq!(ledger.balance_as_of(1, middle).await.unwrap(), 40);
        assert_eq!(ledger.balance_as_of(1, Utc::now()).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_reconcile_detects_unledgered_balance() {
        let store = MemoryStore::new();
        store.insert_user(1);
        let ledger = Ledger::new(Arc::new(store.clone()));

        // Balance moved without a ledger entry
        let mut unit = store.begin(&UnitScope::accounts([1])).await.unwrap();
        unit.apply_delta(1, 10).await.unwrap();
        unit.commit().await.unwrap();

        let err = ledger.reconcile(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }
}

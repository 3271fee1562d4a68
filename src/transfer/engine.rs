//! Transfer Engine
//!
//! Drives a transfer from submission to its terminal state. The row is
//! persisted in `pending` (claiming the idempotency key) before any balance is
//! touched; the balance mutation, both ledger legs and the `completed`
//! transition then commit as one atomic unit.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::{ErrorKind, TransferError};
use super::state::TransferStatus;
use super::types::{
    FailReason, MAX_TRANSFER_AMOUNT, REVERSAL_KEY_PREFIX, Transfer, TransferRequest, reversal_key,
};
use crate::config::EngineConfig;
use crate::core_types::{Points, TransferId, UserId};
use crate::ledger::{
    EventType, Ledger, LedgerEntry, LedgerHistory, NewLedgerEntry, Reconciliation,
};
use crate::store::{AtomicUnit, InsertOutcome, PointsStore, StatusUpdate, UnitScope};

/// Balance change outside any transfer (earn, redeem, manual adjust)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjustment {
    pub user_id: UserId,
    /// Signed delta
    pub change: Points,
    pub event_type: EventType,
    pub reference: Option<String>,
    pub metadata: Option<String>,
}

impl Adjustment {
    pub fn earn(user_id: UserId, amount: Points) -> Self {
        Self::new(user_id, amount, EventType::Earn)
    }

    pub fn redeem(user_id: UserId, amount: Points) -> Self {
        Self::new(user_id, -amount, EventType::Redeem)
    }

    pub fn new(user_id: UserId, change: Points, event_type: EventType) -> Self {
        Self {
            user_id,
            change,
            event_type,
            reference: None,
            metadata: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// Transfer Engine - the only writer of balances and ledger entries
///
/// Quarantined accounts are tracked in this process only. A restart, or
/// another engine over the same store, does not see them; run
/// [`TransferEngine::reconcile`] on startup for any account an operator has
/// not yet released.
pub struct TransferEngine {
    store: Arc<dyn PointsStore>,
    ledger: Ledger,
    config: EngineConfig,
    /// Accounts halted after an invariant violation, with the detecting error
    quarantined: DashMap<UserId, String>,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn PointsStore>, config: EngineConfig) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
            config,
            quarantined: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PointsStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a transfer.
    ///
    /// Returns the settled row: `completed`, or `failed` with
    /// `insufficient_funds`, or `cancelled` if a cancel won the race. A retry
    /// with a known key returns the stored row without side effects.
    pub async fn submit(&self, request: TransferRequest) -> Result<Transfer, TransferError> {
        self.submit_request(request).await
    }

    pub(super) async fn submit_request(
        &self,
        request: TransferRequest,
    ) -> Result<Transfer, TransferError> {
        self.validate(&request)?;

        if let Some(existing) = self
            .store
            .get_transfer_by_key(&request.idempotency_key)
            .await?
        {
            return self.replay(existing, &request).await;
        }

        for user_id in [request.from_user_id, request.to_user_id] {
            if !self.store.user_exists(user_id).await? {
                return Err(TransferError::UserNotFound(user_id));
            }
            self.ensure_not_quarantined(user_id)?;
        }

        let created = match self.store.insert_transfer(&request).await? {
            InsertOutcome::Created(row) => row,
            InsertOutcome::Existing(row) => {
                debug!(
                    idempotency_key = %request.idempotency_key,
                    transfer_id = row.id,
                    "Lost idempotency key race"
                );
                return self.replay(row, &request).await;
            }
        };
        info!(
            transfer_id = created.id,
            idempotency_key = %created.idempotency_key,
            "Transfer created: {} -> {} amount={}",
            created.from_user_id,
            created.to_user_id,
            created.amount
        );

        self.process(created).await
    }

    fn validate(&self, request: &TransferRequest) -> Result<(), TransferError> {
        if request.amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        if request.amount > MAX_TRANSFER_AMOUNT {
            return Err(TransferError::AmountTooLarge(MAX_TRANSFER_AMOUNT));
        }
        if request.from_user_id == request.to_user_id {
            return Err(TransferError::SameAccount);
        }

        let key = &request.idempotency_key;
        if key.trim().is_empty() {
            return Err(TransferError::InvalidIdempotencyKey(
                "must not be empty".to_string(),
            ));
        }
        if key.len() > self.config.max_key_len {
            return Err(TransferError::InvalidIdempotencyKey(format!(
                "longer than {} bytes",
                self.config.max_key_len
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(TransferError::InvalidIdempotencyKey(
                "contains control characters".to_string(),
            ));
        }
        match request.reversal_of {
            None if key.starts_with(REVERSAL_KEY_PREFIX) => {
                return Err(TransferError::InvalidIdempotencyKey(format!(
                    "prefix '{}' is reserved",
                    REVERSAL_KEY_PREFIX
                )));
            }
            Some(original) if *key != reversal_key(original) => {
                return Err(TransferError::InvalidIdempotencyKey(format!(
                    "reversal of {} must use key '{}'",
                    original,
                    reversal_key(original)
                )));
            }
            _ => {}
        }

        if let Some(note) = &request.note
            && note.len() > self.config.max_note_len
        {
            return Err(TransferError::NoteTooLong(self.config.max_note_len));
        }
        Ok(())
    }

    /// Return the row already holding the key, waiting for it to settle
    async fn replay(
        &self,
        existing: Transfer,
        request: &TransferRequest,
    ) -> Result<Transfer, TransferError> {
        if !existing.matches(request) {
            warn!(
                transfer_id = existing.id,
                idempotency_key = %request.idempotency_key,
                "Idempotency key reused with different parameters; returning original transfer"
            );
        }
        self.await_settled(existing).await
    }

    async fn await_settled(&self, mut row: Transfer) -> Result<Transfer, TransferError> {
        let deadline = tokio::time::Instant::now() + self.config.settle_timeout();
        loop {
            if row.status.is_terminal() {
                return replayed(row);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    transfer_id = row.id,
                    status = %row.status,
                    "Duplicate submission timed out waiting for the original to settle"
                );
                return Err(TransferError::DuplicateInFlight {
                    idempotency_key: row.idempotency_key,
                    transfer_id: row.id,
                });
            }
            tokio::time::sleep(self.config.settle_poll_interval()).await;
            row = self.load(row.id).await?;
        }
    }

    async fn process(&self, created: Transfer) -> Result<Transfer, TransferError> {
        let id = created.id;
        let moved = self
            .store
            .update_status(
                id,
                TransferStatus::Pending,
                StatusUpdate::to(TransferStatus::Processing),
            )
            .await;
        let moved = match moved {
            Ok(moved) => moved,
            Err(e) => return Err(self.fail_pending(id, e.into()).await),
        };
        let Some(processing) = moved else {
            // Cancelled before processing began
            let current = self.load(id).await?;
            debug!(transfer_id = id, status = %current.status, "Transfer left pending before processing");
            return self.await_settled(current).await;
        };
        debug!(transfer_id = id, "Transfer processing");

        match self.settle(&processing).await {
            Ok(settled) => Ok(settled),
            Err(e) => self.fail_after_error(&processing, e).await,
        }
    }

    /// The atomic unit: balance check, both deltas, both ledger legs, status
    async fn settle(&self, transfer: &Transfer) -> Result<Transfer, TransferError> {
        let scope = UnitScope::transfer(transfer.id, [transfer.from_user_id, transfer.to_user_id]);
        let mut unit = self.store.begin(&scope).await?;
        let result = self.settle_in_unit(unit.as_mut(), transfer).await;
        if result.is_err() {
            abort(unit.as_mut()).await;
        }
        result
    }

    async fn settle_in_unit(
        &self,
        unit: &mut dyn AtomicUnit,
        transfer: &Transfer,
    ) -> Result<Transfer, TransferError> {
        let id = transfer.id;
        let current = unit
            .transfer(id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(id.to_string()))?;
        if current.status != TransferStatus::Processing {
            // Cancelled or abandoned while waiting for the locks
            debug!(transfer_id = id, status = %current.status, "Transfer no longer processing");
            return Ok(current);
        }

        let (from, to, amount) = (current.from_user_id, current.to_user_id, current.amount);
        let from_balance = unit.balance(from).await?;
        let to_balance = unit.balance(to).await?;

        if from_balance < amount {
            let failed = unit
                .update_status(
                    id,
                    TransferStatus::Processing,
                    StatusUpdate::failed(FailReason::InsufficientFunds),
                )
                .await?
                .ok_or_else(|| lost_row_lock(id))?;
            unit.commit().await?;
            warn!(
                transfer_id = id,
                user_id = from,
                balance = from_balance,
                requested = amount,
                "Transfer failed: insufficient funds"
            );
            return Ok(failed);
        }

        let from_after = unit.apply_delta(from, -amount).await?;
        let to_after = unit.apply_delta(to, amount).await?;

        let (debit, credit, reference, metadata) = match current.reversal_of {
            Some(original) => (
                EventType::ReversalOut,
                EventType::ReversalIn,
                Some(reversal_key(original)),
                current.note.clone(),
            ),
            None => (EventType::TransferOut, EventType::TransferIn, None, None),
        };
        let entries = [
            NewLedgerEntry::transfer_leg(id, from, -amount, from_after, debit)
                .with_reference(reference.clone())
                .with_metadata(metadata.clone()),
            NewLedgerEntry::transfer_leg(id, to, amount, to_after, credit)
                .with_reference(reference)
                .with_metadata(metadata),
        ];
        let opening = HashMap::from([(from, from_balance), (to, to_balance)]);
        self.ledger.append(unit, &opening, &entries).await?;

        let completed = unit
            .update_status(
                id,
                TransferStatus::Processing,
                StatusUpdate::to(TransferStatus::Completed),
            )
            .await?
            .ok_or_else(|| lost_row_lock(id))?;
        unit.commit().await?;

        info!(
            transfer_id = id,
            from_balance = from_after,
            to_balance = to_after,
            "Transfer completed: {} -> {} amount={}",
            from,
            to,
            amount
        );
        Ok(completed)
    }

    /// Best-effort `pending -> failed` when processing could not begin
    async fn fail_pending(&self, id: TransferId, err: TransferError) -> TransferError {
        match self
            .store
            .update_status(
                id,
                TransferStatus::Pending,
                StatusUpdate::failed(FailReason::StoreUnavailable),
            )
            .await
        {
            Ok(Some(_)) => error!(transfer_id = id, error = %err, "Transfer failed before processing"),
            Ok(None) => debug!(transfer_id = id, "Transfer left pending before it could be failed"),
            Err(mark_err) => warn!(
                transfer_id = id,
                error = %mark_err,
                "Could not mark transfer failed; recovery worker will abandon it"
            ),
        }
        err.with_transfer(id)
    }

    /// Record a failed atomic unit on the row, outside the rolled-back unit
    async fn fail_after_error(
        &self,
        transfer: &Transfer,
        err: TransferError,
    ) -> Result<Transfer, TransferError> {
        let id = transfer.id;
        let reason = match err.kind() {
            ErrorKind::InvariantViolation => FailReason::InvariantViolation,
            _ => FailReason::StoreUnavailable,
        };

        match self
            .store
            .update_status(id, TransferStatus::Processing, StatusUpdate::failed(reason))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                // A commit reported as failed may still have landed
                if let Ok(Some(current)) = self.store.get_transfer(id).await
                    && current.status == TransferStatus::Completed
                {
                    warn!(transfer_id = id, error = %err, "Commit error but transfer completed");
                    return Ok(current);
                }
            }
            Err(mark_err) => {
                warn!(
                    transfer_id = id,
                    error = %mark_err,
                    "Could not mark transfer failed; recovery worker will abandon it"
                );
            }
        }

        if reason == FailReason::InvariantViolation {
            error!(
                transfer_id = id,
                error = %err,
                "CRITICAL: ledger invariant violated, quarantining accounts"
            );
            self.quarantine(&[transfer.from_user_id, transfer.to_user_id], &err);
        } else {
            error!(transfer_id = id, error = %err, "Transfer failed: atomic unit rolled back");
        }
        Err(err.with_transfer(id))
    }

    pub async fn get_transfer(&self, id: TransferId) -> Result<Transfer, TransferError> {
        self.load(id).await
    }

    pub async fn get_transfer_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Transfer, TransferError> {
        self.store
            .get_transfer_by_key(key)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(key.to_string()))
    }

    async fn load(&self, id: TransferId) -> Result<Transfer, TransferError> {
        self.store
            .get_transfer(id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(id.to_string()))
    }

    /// Cancel a transfer whose balance mutation has not committed.
    ///
    /// Takes the transfer's row lock, so a cancel racing the atomic unit either
    /// lands first (the unit then leaves the row alone) or observes the
    /// committed outcome and reports `AlreadyCommitted`.
    pub async fn cancel(&self, id: TransferId) -> Result<Transfer, TransferError> {
        let current = self.load(id).await?;
        if !current.status.is_cancellable() {
            return cancel_rejected(current);
        }

        let mut unit = self.store.begin(&UnitScope::transfer_row(id)).await?;
        let row = unit
            .transfer(id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(id.to_string()))?;
        if !row.status.is_cancellable() {
            abort(unit.as_mut()).await;
            return cancel_rejected(row);
        }

        let cancelled = unit
            .update_status(id, row.status, StatusUpdate::to(TransferStatus::Cancelled))
            .await?
            .ok_or_else(|| lost_row_lock(id))?;
        unit.commit().await?;
        info!(transfer_id = id, from = %row.status, "Transfer cancelled");
        Ok(cancelled)
    }

    /// Apply an earn/redeem/adjust change in its own atomic unit
    pub async fn adjust(&self, adjustment: Adjustment) -> Result<LedgerEntry, TransferError> {
        let Adjustment {
            user_id,
            change,
            event_type,
            reference,
            metadata,
        } = adjustment;

        let sign_ok = match event_type {
            EventType::Earn => change > 0,
            EventType::Redeem => change < 0,
            EventType::Adjust => change != 0,
            other => {
                return Err(TransferError::InvalidAdjustment(format!(
                    "{} is reserved for transfers",
                    other
                )));
            }
        };
        if !sign_ok {
            return Err(TransferError::InvalidAdjustment(format!(
                "change {} is invalid for {}",
                change, event_type
            )));
        }
        if change.unsigned_abs() > MAX_TRANSFER_AMOUNT.unsigned_abs() {
            return Err(TransferError::AmountTooLarge(MAX_TRANSFER_AMOUNT));
        }
        for text in [&reference, &metadata].into_iter().flatten() {
            if text.len() > self.config.max_note_len {
                return Err(TransferError::NoteTooLong(self.config.max_note_len));
            }
        }
        self.ensure_not_quarantined(user_id)?;

        let mut unit = self.store.begin(&UnitScope::accounts([user_id])).await?;
        let entry = NewLedgerEntry::adjustment(user_id, change, 0, event_type)
            .with_reference(reference)
            .with_metadata(metadata);
        let result = self.adjust_in_unit(unit.as_mut(), entry).await;
        match result {
            Ok(written) => {
                info!(
                    user_id,
                    change,
                    balance = written.balance_after,
                    event_type = %written.event_type,
                    "Balance adjusted"
                );
                Ok(written)
            }
            Err(e) => {
                abort(unit.as_mut()).await;
                if e.kind() == ErrorKind::InvariantViolation {
                    error!(user_id, error = %e, "CRITICAL: ledger invariant violated on adjustment");
                    self.quarantine(&[user_id], &e);
                }
                Err(e)
            }
        }
    }

    async fn adjust_in_unit(
        &self,
        unit: &mut dyn AtomicUnit,
        mut entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, TransferError> {
        let user_id = entry.user_id;
        let before = unit.balance(user_id).await?;
        if before.checked_add(entry.change).is_none_or(|after| after < 0) {
            warn!(user_id, balance = before, change = entry.change, "Adjustment rejected: insufficient funds");
            return Err(TransferError::InsufficientFunds {
                transfer_id: None,
                user_id,
                requested: -entry.change,
            });
        }

        entry.balance_after = unit.apply_delta(user_id, entry.change).await?;
        let opening = HashMap::from([(user_id, before)]);
        let mut written = self
            .ledger
            .append(unit, &opening, std::slice::from_ref(&entry))
            .await?;
        unit.commit().await?;
        written
            .pop()
            .ok_or_else(|| TransferError::invariant(Some(user_id), "store wrote no ledger entry"))
    }

    /// Committed balance of a user
    pub async fn get_balance(&self, user_id: UserId) -> Result<Points, TransferError> {
        Ok(self.store.get_balance(user_id).await?)
    }

    /// Lazy ledger history of a user, oldest entry first
    pub fn history(&self, user_id: UserId) -> LedgerHistory {
        self.ledger.history(user_id)
    }

    /// Check an account's ledger against its balance; quarantines it on mismatch
    pub async fn reconcile(&self, user_id: UserId) -> Result<Reconciliation, TransferError> {
        match self.ledger.reconcile(user_id).await {
            Err(e) if e.kind() == ErrorKind::InvariantViolation => {
                error!(user_id, error = %e, "CRITICAL: reconciliation failed");
                self.quarantine(&[user_id], &e);
                Err(e)
            }
            other => other,
        }
    }

    pub fn is_quarantined(&self, user_id: UserId) -> bool {
        self.quarantined.contains_key(&user_id)
    }

    /// Lift a quarantine after manual reconciliation. Returns false if the
    /// account was not quarantined.
    pub fn release_account(&self, user_id: UserId) -> bool {
        let released = self.quarantined.remove(&user_id).is_some();
        if released {
            info!(user_id, "Account released from quarantine");
        }
        released
    }

    fn quarantine(&self, users: &[UserId], cause: &TransferError) {
        for user_id in users {
            self.quarantined.insert(*user_id, cause.to_string());
        }
    }

    pub(super) fn ensure_not_quarantined(&self, user_id: UserId) -> Result<(), TransferError> {
        match self.quarantined.get(&user_id) {
            Some(cause) => Err(TransferError::invariant(
                Some(user_id),
                format!("account {} is quarantined: {}", user_id, cause.value()),
            )),
            None => Ok(()),
        }
    }
}

/// Outcome handed to a duplicate submission of a settled row.
///
/// Rows that failed on the store or an invariant surfaced as errors to the
/// original caller, so duplicates get the same error.
fn replayed(row: Transfer) -> Result<Transfer, TransferError> {
    if row.status == TransferStatus::Failed
        && row.fail_reason != Some(FailReason::InsufficientFunds)
        && let Err(e) = row.outcome()
    {
        return Err(e);
    }
    Ok(row)
}

fn cancel_rejected(row: Transfer) -> Result<Transfer, TransferError> {
    match row.status {
        TransferStatus::Cancelled => Ok(row),
        TransferStatus::Completed | TransferStatus::Reversed => {
            Err(TransferError::AlreadyCommitted {
                transfer_id: row.id,
                status: row.status,
            })
        }
        status => Err(TransferError::InvalidState {
            transfer_id: row.id,
            status,
            action: "cancelled",
        }),
    }
}

/// The row changed under a lock this unit holds
fn lost_row_lock(id: TransferId) -> TransferError {
    TransferError::invariant(None, format!("transfer {} changed while locked", id))
}

/// Roll back a unit whose result is already decided
pub(super) async fn abort(unit: &mut dyn AtomicUnit) {
    if let Err(e) = unit.rollback().await {
        debug!(error = %e, "Rollback after failed unit");
    }
}

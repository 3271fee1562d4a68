//! Reversal of completed transfers
//!
//! A reversal is an ordinary transfer with the endpoints swapped, submitted
//! under the key `reversal:<original id>`. The original moves to `reversed`
//! only once that compensating transfer has completed.

use tracing::{info, warn};

use super::engine::{TransferEngine, abort};
use super::error::TransferError;
use super::state::TransferStatus;
use super::types::{FailReason, Transfer, TransferRequest};
use crate::core_types::TransferId;
use crate::store::{StatusUpdate, UnitScope};

impl TransferEngine {
    /// Undo a completed transfer.
    ///
    /// Repeating the call for the same transfer is idempotent. If the
    /// compensating transfer fails the original stays `completed` and
    /// `ReversalFailed` is returned; the attempt is not retried.
    pub async fn reverse(
        &self,
        transfer_id: TransferId,
        reason: &str,
    ) -> Result<Transfer, TransferError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(TransferError::InvalidReason("must not be empty".to_string()));
        }
        if reason.len() > self.config().max_note_len {
            return Err(TransferError::InvalidReason(format!(
                "longer than {} bytes",
                self.config().max_note_len
            )));
        }

        let original = self.get_transfer(transfer_id).await?;
        if original.is_reversal() {
            return Err(TransferError::InvalidState {
                transfer_id,
                status: original.status,
                action: "reversed (it is itself a reversal)",
            });
        }
        match original.status {
            TransferStatus::Reversed => return Ok(original),
            TransferStatus::Completed => {}
            status => {
                return Err(TransferError::InvalidState {
                    transfer_id,
                    status,
                    action: "reversed",
                });
            }
        }

        let compensating = match self
            .submit_request(TransferRequest::reversal(&original, reason))
            .await
        {
            Ok(row) => row,
            // The compensating row exists but failed on the store
            Err(TransferError::StoreUnavailable {
                transfer_id: Some(compensating_id),
                message,
            }) => {
                warn!(transfer_id, compensating_id, error = %message, "Reversal failed; original stays completed");
                let status = self
                    .get_transfer(compensating_id)
                    .await
                    .map_or(TransferStatus::Failed, |row| row.status);
                return Err(TransferError::ReversalFailed {
                    transfer_id,
                    compensating_id,
                    status,
                    insufficient_funds: false,
                });
            }
            Err(e) => return Err(e),
        };
        if compensating.status != TransferStatus::Completed {
            warn!(
                transfer_id,
                compensating_id = compensating.id,
                status = %compensating.status,
                "Reversal failed; original stays completed"
            );
            return Err(TransferError::ReversalFailed {
                transfer_id,
                compensating_id: compensating.id,
                status: compensating.status,
                insufficient_funds: compensating.fail_reason == Some(FailReason::InsufficientFunds),
            });
        }

        self.mark_reversed(transfer_id, compensating.id).await
    }

    async fn mark_reversed(
        &self,
        transfer_id: TransferId,
        compensating_id: TransferId,
    ) -> Result<Transfer, TransferError> {
        let mut unit = self
            .store()
            .begin(&UnitScope::transfer_row(transfer_id))
            .await?;
        let row = unit
            .transfer(transfer_id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))?;

        match row.status {
            TransferStatus::Completed => {
                let reversed = unit
                    .update_status(
                        transfer_id,
                        TransferStatus::Completed,
                        StatusUpdate::to(TransferStatus::Reversed),
                    )
                    .await?
                    .ok_or_else(|| {
                        TransferError::invariant(
                            None,
                            format!("transfer {} changed while locked", transfer_id),
                        )
                    })?;
                unit.commit().await?;
                info!(transfer_id, compensating_id, "Transfer reversed");
                Ok(reversed)
            }
            // A concurrent reverse call got here first
            TransferStatus::Reversed => {
                abort(unit.as_mut()).await;
                Ok(row)
            }
            status => {
                abort(unit.as_mut()).await;
                Err(TransferError::InvalidState {
                    transfer_id,
                    status,
                    action: "reversed",
                })
            }
        }
    }
}

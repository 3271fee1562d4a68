//! Recovery Worker
//!
//! Background worker that fails transfers stranded in `pending`/`processing`.
//!
//! A transfer only moves balances inside an atomic unit that also completes
//! it, so a row still non-terminal after the unit's locks are free never had
//! any effect and can be failed with reason `abandoned`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::engine::TransferEngine;
use super::error::TransferError;
use super::types::{FailReason, Transfer};
use crate::config::RecoveryConfig;
use crate::store::{StatusUpdate, UnitScope};

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale transfers
    pub scan_interval: Duration,
    /// How long a transfer must be untouched to be considered stranded
    pub stale_threshold: Duration,
    /// Maximum transfers to process per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for WorkerConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            stale_threshold: Duration::from_secs(config.stale_threshold_secs),
            batch_size: config.batch_size,
        }
    }
}

/// Recovery Worker
pub struct RecoveryWorker {
    engine: Arc<TransferEngine>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(engine: Arc<TransferEngine>, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    pub fn with_defaults(engine: Arc<TransferEngine>) -> Self {
        Self::new(engine, WorkerConfig::default())
    }

    /// Run the recovery loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single scan; returns how many transfers were abandoned
    pub async fn scan_and_recover(&self) -> Result<usize, TransferError> {
        let Some(cutoff) = chrono::Duration::from_std(self.config.stale_threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
        else {
            return Ok(0);
        };

        let stale = self
            .engine
            .store()
            .list_stale(cutoff, self.config.batch_size)
            .await?;
        if stale.is_empty() {
            debug!("No stale transfers found");
            return Ok(0);
        }
        info!(count = stale.len(), "Found stale transfers");

        let mut recovered = 0;
        for transfer in &stale {
            match self.abandon(transfer, cutoff).await {
                Ok(Some(failed)) => {
                    warn!(
                        transfer_id = failed.id,
                        idempotency_key = %failed.idempotency_key,
                        was = %transfer.status,
                        "Stranded transfer marked failed (abandoned)"
                    );
                    recovered += 1;
                }
                Ok(None) => {
                    debug!(transfer_id = transfer.id, "Transfer progressed before recovery");
                }
                Err(e) => {
                    error!(transfer_id = transfer.id, error = %e, "Failed to recover transfer");
                }
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered transfers this scan");
        }
        Ok(recovered)
    }

    /// Fail one row under its lock if it is still stranded
    async fn abandon(
        &self,
        transfer: &Transfer,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Transfer>, TransferError> {
        let mut unit = self
            .engine
            .store()
            .begin(&UnitScope::transfer_row(transfer.id))
            .await?;
        let Some(current) = unit.transfer(transfer.id).await? else {
            return Ok(None);
        };
        if current.status.is_terminal() || current.updated_at >= cutoff {
            unit.rollback().await?;
            return Ok(None);
        }

        let failed = unit
            .update_status(
                current.id,
                current.status,
                StatusUpdate::failed(FailReason::Abandoned),
            )
            .await?;
        unit.commit().await?;
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::{MemoryStore, PointsStore};
    use crate::transfer::{TransferRequest, TransferStatus};

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
    }

    #[tokio::test]
    async fn test_abandons_only_stranded_rows() {
        let store = MemoryStore::new();
        store.insert_user(1);
        store.insert_user(2);
        let engine = Arc::new(TransferEngine::new(
            Arc::new(store.clone()),
            EngineConfig::default(),
        ));

        store
            .insert_transfer(&TransferRequest::new(1, 2, 10, "stranded"))
            .await
            .unwrap();
        let settled = engine
            .submit(TransferRequest::new(1, 2, 10, "settled"))
            .await
            .unwrap();
        assert_eq!(settled.status, TransferStatus::Failed);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let worker = RecoveryWorker::new(
            engine.clone(),
            WorkerConfig {
                stale_threshold: Duration::ZERO,
                ..WorkerConfig::default()
            },
        );
        assert_eq!(worker.scan_and_recover().await.unwrap(), 1);

        let row = engine.get_transfer_by_idempotency_key("stranded").await.unwrap();
        assert_eq!(row.status, TransferStatus::Failed);
        assert_eq!(row.fail_reason, Some(FailReason::Abandoned));
        assert_eq!(worker.scan_and_recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fresh_rows_are_left_alone() {
        let store = MemoryStore::new();
        store.insert_user(1);
        store.insert_user(2);
        let engine = Arc::new(TransferEngine::new(
            Arc::new(store.clone()),
            EngineConfig::default(),
        ));
        store
            .insert_transfer(&TransferRequest::new(1, 2, 10, "fresh"))
            .await
            .unwrap();

        let worker = RecoveryWorker::with_defaults(engine);
        assert_eq!(worker.scan_and_recover().await.unwrap(), 0);
    }
}

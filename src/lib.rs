//! Points Ledger - transactional points transfers
//!
//! # Modules
//!
//! - [`core_types`] - Id and amount aliases
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup
//! - [`store`] - Storage seam: atomic units over balances, transfers and the ledger
//! - [`ledger`] - Append-only balance audit log
//! - [`transfer`] - Transfer engine, state machine, reversals, recovery

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod logging;

pub mod ledger;
pub mod store;
pub mod transfer;

// Convenient re-exports at crate root
pub use core_types::{LedgerEntryId, Points, TransferId, UserId};
pub use ledger::{EventType, Ledger, LedgerEntry, LedgerHistory, Reconciliation};
pub use store::{MemoryStore, PgStore, PointsStore, StoreError};
pub use transfer::{
    Adjustment, ErrorKind, RecoveryWorker, Transfer, TransferEngine, TransferError,
    TransferRequest, TransferStatus,
};

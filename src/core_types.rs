//! Core types used throughout the system
//!
//! Identifier aliases shared by the store, the ledger and the transfer engine.

/// User ID - owned by the external account store, immutable after assignment.
pub type UserId = u64;

/// Transfer ID - assigned by the store when a transfer row is first created.
pub type TransferId = u64;

/// Ledger entry ID - increasing in creation order for any one user.
///
/// History cursors page on this value, so a store must never commit an entry
/// for a user with an id lower than that user's newest committed entry.
pub type LedgerEntryId = u64;

/// Points quantity.
///
/// Signed so a single type covers balances, positive transfer amounts and
/// ledger deltas. Balances are never negative.
pub type Points = i64;

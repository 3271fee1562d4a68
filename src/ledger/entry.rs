//! Ledger entry types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::{LedgerEntryId, Points, TransferId, UserId};

/// What caused a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TransferOut,
    TransferIn,
    Adjust,
    Earn,
    Redeem,
    /// Debit leg of a compensating transfer
    ReversalOut,
    /// Credit leg of a compensating transfer
    ReversalIn,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TransferOut => "transfer_out",
            EventType::TransferIn => "transfer_in",
            EventType::Adjust => "adjust",
            EventType::Earn => "earn",
            EventType::Redeem => "redeem",
            EventType::ReversalOut => "reversal_out",
            EventType::ReversalIn => "reversal_in",
        }
    }

    /// Debit leg of a transfer pair
    #[inline]
    pub fn is_debit_leg(&self) -> bool {
        matches!(self, EventType::TransferOut | EventType::ReversalOut)
    }

    /// Credit leg of a transfer pair
    #[inline]
    pub fn is_credit_leg(&self) -> bool {
        matches!(self, EventType::TransferIn | EventType::ReversalIn)
    }

    /// Standalone balance events written without a transfer
    #[inline]
    pub fn is_adjustment(&self) -> bool {
        matches!(self, EventType::Adjust | EventType::Earn | EventType::Redeem)
    }

    pub const ALL: [EventType; 7] = [
        EventType::TransferOut,
        EventType::TransferIn,
        EventType::Adjust,
        EventType::Earn,
        EventType::Redeem,
        EventType::ReversalOut,
        EventType::ReversalIn,
    ];
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("unknown ledger event type: {}", s))
    }
}

/// Immutable record of one signed balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    /// Signed delta applied to the user's balance
    pub change: Points,
    /// Balance immediately after this entry
    pub balance_after: Points,
    pub event_type: EventType,
    /// Back-reference only; the transfer does not own the entry
    pub transfer_id: Option<TransferId>,
    pub reference: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Entry as handed to the store; id and timestamp are assigned on append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub change: Points,
    pub balance_after: Points,
    pub event_type: EventType,
    pub transfer_id: Option<TransferId>,
    pub reference: Option<String>,
    pub metadata: Option<String>,
}

impl NewLedgerEntry {
    /// One leg of a transfer pair
    pub fn transfer_leg(
        transfer_id: TransferId,
        user_id: UserId,
        change: Points,
        balance_after: Points,
        event_type: EventType,
    ) -> Self {
        Self {
            user_id,
            change,
            balance_after,
            event_type,
            transfer_id: Some(transfer_id),
            reference: None,
            metadata: None,
        }
    }

    pub fn adjustment(
        user_id: UserId,
        change: Points,
        balance_after: Points,
        event_type: EventType,
    ) -> Self {
        Self {
            user_id,
            change,
            balance_after,
            event_type,
            transfer_id: None,
            reference: None,
            metadata: None,
        }
    }

    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materialize with store-assigned identity
    pub fn into_entry(self, id: LedgerEntryId, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id,
            user_id: self.user_id,
            change: self.change,
            balance_after: self.balance_after,
            event_type: self.event_type,
            transfer_id: self.transfer_id,
            reference: self.reference,
            metadata: self.metadata,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_legs() {
        assert!(EventType::TransferOut.is_debit_leg());
        assert!(EventType::ReversalOut.is_debit_leg());
        assert!(EventType::TransferIn.is_credit_leg());
        assert!(EventType::ReversalIn.is_credit_leg());
        assert!(!EventType::Earn.is_debit_leg());
        assert!(EventType::Redeem.is_adjustment());
        assert!(!EventType::TransferIn.is_adjustment());
    }

    #[test]
    fn test_event_type_names() {
        for event in EventType::ALL {
            assert_eq!(event.as_str().parse::<EventType>(), Ok(event));
            assert_eq!(
                serde_json::to_string(&event).unwrap(),
                format!("\"{}\"", event.as_str())
            );
        }
    }
}

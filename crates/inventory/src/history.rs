//! Batch history log.
//!
//! One [`BatchHistoryEntry`] per batch quantity change, written in the same
//! transaction as the change itself. Entries are never updated; replaying them
//! in append order from the batch's initial quantity yields its current
//! quantity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{BatchId, HistoryEntryId, UserId};

use crate::ledger::MovementReason;

/// Typed reason for a batch quantity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    #[default]
    Sale,
    TransferOut,
    TransferIn,
    Adjustment,
    ExpiryLoss,
    Damage,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Sale => "sale",
            ChangeType::TransferOut => "transfer_out",
            ChangeType::TransferIn => "transfer_in",
            ChangeType::Adjustment => "adjustment",
            ChangeType::ExpiryLoss => "expiry_loss",
            ChangeType::Damage => "damage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sale" => ChangeType::Sale,
            "transfer_out" => ChangeType::TransferOut,
            "transfer_in" => ChangeType::TransferIn,
            "adjustment" => ChangeType::Adjustment,
            "expiry_loss" => ChangeType::ExpiryLoss,
            "damage" => ChangeType::Damage,
            _ => return None,
        })
    }

    /// Ledger reason recorded alongside a batch change of this type.
    pub fn movement_reason(&self) -> MovementReason {
        match self {
            ChangeType::Sale => MovementReason::Sale,
            ChangeType::TransferOut => MovementReason::TransferOut,
            ChangeType::TransferIn => MovementReason::TransferIn,
            ChangeType::Adjustment => MovementReason::Adjustment,
            ChangeType::ExpiryLoss => MovementReason::ExpiryLoss,
            ChangeType::Damage => MovementReason::Damage,
        }
    }
}

impl core::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one batch quantity change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHistoryEntry {
    pub id: HistoryEntryId,
    pub batch_id: BatchId,
    pub previous_quantity: i64,
    pub quantity_change: i64,
    pub new_quantity: i64,
    pub change_type: ChangeType,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl BatchHistoryEntry {
    /// Record a change from already-checked before/after quantities.
    pub fn record(
        batch_id: BatchId,
        previous_quantity: i64,
        new_quantity: i64,
        change_type: ChangeType,
        reference: Option<String>,
        actor: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: HistoryEntryId::new(),
            batch_id,
            previous_quantity,
            quantity_change: new_quantity - previous_quantity,
            new_quantity,
            change_type,
            reference,
            actor,
            occurred_at,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.new_quantity == self.previous_quantity + self.quantity_change
    }
}

/// Replay a batch's history from its initial quantity.
pub fn replay_batch<'a>(
    initial_quantity: i64,
    entries: impl IntoIterator<Item = &'a BatchHistoryEntry>,
) -> i64 {
    entries
        .into_iter()
        .fold(initial_quantity, |qty, e| qty + e.quantity_change)
}

/// Cost of goods sold for a batch: units consumed by sales × unit cost.
pub fn cost_of_goods_sold<'a>(
    unit_cost: i64,
    entries: impl IntoIterator<Item = &'a BatchHistoryEntry>,
) -> i64 {
    let sold: i64 = entries
        .into_iter()
        .filter(|e| e.change_type == ChangeType::Sale)
        .map(|e| -e.quantity_change)
        .sum();
    sold * unit_cost
}

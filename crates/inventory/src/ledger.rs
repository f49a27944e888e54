//! Location stock ledger rules: delta validation, movement log, replay.
//!
//! Every quantity change at a (product, location) pair goes through
//! [`apply_delta`] and is documented by exactly one [`StockMovement`]. The
//! storage layer writes both in the same transaction as the reconciled
//! product total.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    LedgerError, LedgerResult, LocationId, MovementId, ProductId, UserId,
};

/// Why a ledger quantity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    Receipt,
    Sale,
    TransferOut,
    TransferIn,
    Adjustment,
    Return,
    Damage,
    ExpiryLoss,
    LocationRemoved,
}

impl MovementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementReason::Receipt => "receipt",
            MovementReason::Sale => "sale",
            MovementReason::TransferOut => "transfer_out",
            MovementReason::TransferIn => "transfer_in",
            MovementReason::Adjustment => "adjustment",
            MovementReason::Return => "return",
            MovementReason::Damage => "damage",
            MovementReason::ExpiryLoss => "expiry_loss",
            MovementReason::LocationRemoved => "location_removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "receipt" => MovementReason::Receipt,
            "sale" => MovementReason::Sale,
            "transfer_out" => MovementReason::TransferOut,
            "transfer_in" => MovementReason::TransferIn,
            "adjustment" => MovementReason::Adjustment,
            "return" => MovementReason::Return,
            "damage" => MovementReason::Damage,
            "expiry_loss" => MovementReason::ExpiryLoss,
            "location_removed" => MovementReason::LocationRemoved,
            _ => return None,
        })
    }
}

impl core::fmt::Display for MovementReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command: change the quantity of a product at a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustQuantity {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub delta: i64,
    pub reason: MovementReason,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: move stock between two locations as one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferQuantity {
    pub product_id: ProductId,
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub quantity: i64,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl TransferQuantity {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.quantity <= 0 {
            return Err(LedgerError::invalid_quantity(
                "transfer quantity must be positive",
            ));
        }
        if self.from_location == self.to_location {
            return Err(LedgerError::invalid_quantity(
                "transfer source and destination must differ",
            ));
        }
        Ok(())
    }
}

/// Before/after values of one ledger write, precise enough to hand to an
/// audit logger unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerChange {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub previous_total: i64,
    pub new_total: i64,
}

impl LedgerChange {
    pub fn delta(&self) -> i64 {
        self.new_quantity - self.previous_quantity
    }
}

/// Result of a two-sided transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub source: LedgerChange,
    pub destination: LedgerChange,
}

/// Append-only record of one ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub previous_quantity: i64,
    pub quantity_change: i64,
    pub new_quantity: i64,
    pub reason: MovementReason,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        product_id: ProductId,
        location_id: LocationId,
        previous_quantity: i64,
        quantity_change: i64,
        reason: MovementReason,
        reference: Option<String>,
        actor: Option<UserId>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MovementId::new(),
            product_id,
            location_id,
            previous_quantity,
            quantity_change,
            new_quantity: previous_quantity + quantity_change,
            reason,
            reference,
            actor,
            occurred_at,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.new_quantity == self.previous_quantity + self.quantity_change
    }
}

/// Validate a delta against the current quantity and return the new quantity.
///
/// A zero delta is rejected. Going below zero is `InsufficientStock` unless
/// the ledger is configured to allow negative stock.
pub fn apply_delta(
    product_id: ProductId,
    location_id: LocationId,
    current: i64,
    delta: i64,
    allow_negative: bool,
) -> LedgerResult<i64> {
    if delta == 0 {
        return Err(LedgerError::invalid_quantity("delta cannot be zero"));
    }
    let next = current
        .checked_add(delta)
        .ok_or_else(|| LedgerError::invalid_quantity("quantity overflow"))?;
    if next < 0 && !allow_negative {
        return Err(LedgerError::insufficient_stock(
            product_id,
            location_id,
            delta.saturating_neg(),
            current.max(0),
        ));
    }
    Ok(next)
}

/// Reject a delta that would push the product's cached total out of range.
pub fn check_total(product_id: ProductId, total: i64, delta: i64) -> LedgerResult<i64> {
    total.checked_add(delta).ok_or_else(|| {
        LedgerError::invalid_quantity(format!("total quantity of product {product_id} overflows"))
    })
}

/// Rebuild a stock level quantity from its movement log (starting at zero).
pub fn replay_movements<'a>(movements: impl IntoIterator<Item = &'a StockMovement>) -> i64 {
    movements
        .into_iter()
        .fold(0, |qty, m| qty + m.quantity_change)
}

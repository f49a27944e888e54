//! Serialized units and their status state machine.
//!
//! Transitions are an explicit table ([`SerialStatus::allowed_next`]); any
//! change not listed there is rejected with `InvalidTransition`. Units are
//! never deleted, only transitioned.

use std::collections::HashSet;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    BatchId, LedgerError, LedgerResult, ProductId, SerialNumberId, StockLevelId,
};

/// Lifecycle status of one serialized unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialStatus {
    InStock,
    Reserved,
    Sold,
    Returned,
    Defective,
    InTransit,
    Quarantine,
}

impl SerialStatus {
    pub const ALL: [SerialStatus; 7] = [
        SerialStatus::InStock,
        SerialStatus::Reserved,
        SerialStatus::Sold,
        SerialStatus::Returned,
        SerialStatus::Defective,
        SerialStatus::InTransit,
        SerialStatus::Quarantine,
    ];

    /// Legal next states.
    pub fn allowed_next(self) -> &'static [SerialStatus] {
        use crate::serial::SerialStatus::*;
        match self {
            InStock => &[Reserved, Sold, Defective, InTransit, Quarantine],
            Reserved => &[Sold, InStock],
            Sold => &[Returned],
            Returned => &[InStock, Quarantine, Defective],
            InTransit => &[InStock],
            Quarantine => &[InStock, Defective],
            Defective => &[],
        }
    }

    pub fn can_transition_to(self, to: SerialStatus) -> bool {
        self.allowed_next().contains(&to)
    }

    /// Validate a transition and return the new status.
    pub fn transition_to(self, to: SerialStatus) -> LedgerResult<SerialStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(LedgerError::invalid_transition(self, to))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SerialStatus::InStock => "in_stock",
            SerialStatus::Reserved => "reserved",
            SerialStatus::Sold => "sold",
            SerialStatus::Returned => "returned",
            SerialStatus::Defective => "defective",
            SerialStatus::InTransit => "in_transit",
            SerialStatus::Quarantine => "quarantine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl core::fmt::Display for SerialStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One individually tracked unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialNumber {
    pub id: SerialNumberId,
    pub product_id: ProductId,
    pub batch_id: Option<BatchId>,
    pub stock_level_id: Option<StockLevelId>,
    pub serial_number: String,
    pub status: SerialStatus,
    pub warranty_expiry: Option<DateTime<Utc>>,
    pub unit_cost: Option<i64>,
    pub sold_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Before/after status of a committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialTransition {
    pub serial_id: SerialNumberId,
    pub previous: SerialStatus,
    pub current: SerialStatus,
}

impl SerialNumber {
    /// Move the unit to `to`, stamping `sold_at` on sale and optionally
    /// rebinding it to the stock level it arrived at.
    pub fn transition(
        &mut self,
        to: SerialStatus,
        stock_level_id: Option<StockLevelId>,
        occurred_at: DateTime<Utc>,
    ) -> LedgerResult<SerialTransition> {
        let previous = self.status;
        self.status = previous.transition_to(to)?;
        if to == SerialStatus::Sold {
            self.sold_at = Some(occurred_at);
        }
        if let Some(level) = stock_level_id {
            self.stock_level_id = Some(level);
        }
        self.updated_at = occurred_at;
        Ok(SerialTransition {
            serial_id: self.id,
            previous,
            current: to,
        })
    }

    pub fn is_under_warranty(&self, at: DateTime<Utc>) -> bool {
        self.warranty_expiry.is_some_and(|w| at <= w)
    }
}

/// One serial in a bulk creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSerial {
    pub serial_number: String,
    pub unit_cost: Option<i64>,
}

impl NewSerial {
    pub fn new(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            unit_cost: None,
        }
    }
}

/// Command: register received units in bulk (all-or-nothing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSerialNumbers {
    pub product_id: ProductId,
    pub serials: Vec<NewSerial>,
    pub batch_id: Option<BatchId>,
    pub stock_level_id: Option<StockLevelId>,
    pub warranty_months: u32,
    pub received_at: DateTime<Utc>,
}

impl CreateSerialNumbers {
    /// Request-local validation; collisions with stored serials are checked by
    /// the store inside the creating transaction.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.serials.is_empty() {
            return Err(LedgerError::invalid_quantity(
                "at least one serial number is required",
            ));
        }
        let mut seen = HashSet::with_capacity(self.serials.len());
        for s in &self.serials {
            let serial = s.serial_number.trim();
            if serial.is_empty() {
                return Err(LedgerError::validation("serial number cannot be blank"));
            }
            if s.unit_cost.is_some_and(|c| c < 0) {
                return Err(LedgerError::invalid_quantity("unit cost cannot be negative"));
            }
            if !seen.insert(serial) {
                return Err(LedgerError::DuplicateSerialNumber {
                    product_id: self.product_id,
                    serial_number: serial.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Warranty end for units received now; `None` when no warranty applies.
    pub fn warranty_expiry(&self) -> LedgerResult<Option<DateTime<Utc>>> {
        if self.warranty_months == 0 {
            return Ok(None);
        }
        self.received_at
            .checked_add_months(Months::new(self.warranty_months))
            .map(Some)
            .ok_or_else(|| LedgerError::validation("warranty period out of range"))
    }

    /// Build the rows to insert, all in `InStock`.
    pub fn build(&self) -> LedgerResult<Vec<SerialNumber>> {
        self.validate()?;
        let warranty_expiry = self.warranty_expiry()?;
        Ok(self
            .serials
            .iter()
            .map(|s| SerialNumber {
                id: SerialNumberId::new(),
                product_id: self.product_id,
                batch_id: self.batch_id,
                stock_level_id: self.stock_level_id,
                serial_number: s.serial_number.trim().to_string(),
                status: SerialStatus::InStock,
                warranty_expiry,
                unit_cost: s.unit_cost,
                sold_at: None,
                created_at: self.received_at,
                updated_at: self.received_at,
            })
            .collect())
    }
}

/// Command: change one unit's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSerialStatus {
    pub serial_id: SerialNumberId,
    pub to: SerialStatus,
    pub stock_level_id: Option<StockLevelId>,
    pub occurred_at: DateTime<Utc>,
}

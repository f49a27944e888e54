//! Products, locations and per-location stock level rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{LedgerError, LedgerResult, LocationId, ProductId, StockLevelId};

/// A stocked product.
///
/// `total_quantity` is a cached aggregate: it always equals the sum of the
/// product's [`StockLevel`] rows and is only ever written by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub reorder_threshold: i64,
    pub total_quantity: i64,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn is_low_stock(&self) -> bool {
        self.total_quantity <= self.reorder_threshold
    }
}

/// Input: register a product with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub reorder_threshold: i64,
    pub occurred_at: DateTime<Utc>,
}

impl NewProduct {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.sku.trim().is_empty() {
            return Err(LedgerError::validation("sku cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(LedgerError::validation("name cannot be empty"));
        }
        if self.reorder_threshold < 0 {
            return Err(LedgerError::invalid_quantity(
                "reorder threshold cannot be negative",
            ));
        }
        Ok(())
    }

    pub fn into_product(self) -> Product {
        Product {
            id: self.product_id,
            sku: self.sku,
            name: self.name,
            reorder_threshold: self.reorder_threshold,
            total_quantity: 0,
            created_at: self.occurred_at,
        }
    }
}

/// A place stock is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub is_primary: bool,
}

/// Input: register a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLocation {
    pub location_id: LocationId,
    pub name: String,
    pub is_primary: bool,
}

impl NewLocation {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::validation("location name cannot be empty"));
        }
        Ok(())
    }

    pub fn into_location(self) -> Location {
        Location {
            id: self.location_id,
            name: self.name,
            is_primary: self.is_primary,
        }
    }
}

/// Quantity of one product at one location. One row per pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub id: StockLevelId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub updated_at: DateTime<Utc>,
}

/// Read model row for the reorder report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockItem {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub total_quantity: i64,
    pub reorder_threshold: i64,
}

impl From<&Product> for LowStockItem {
    fn from(p: &Product) -> Self {
        Self {
            product_id: p.id,
            sku: p.sku.clone(),
            name: p.name.clone(),
            total_quantity: p.total_quantity,
            reorder_threshold: p.reorder_threshold,
        }
    }
}

/// Sum of a product's stock level rows; the value the cached total must equal.
pub fn reconciled_total<'a>(levels: impl IntoIterator<Item = &'a StockLevel>) -> i64 {
    levels.into_iter().map(|l| l.quantity).sum()
}

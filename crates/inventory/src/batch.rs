//! Batch (lot) ledger rows and their depletion order.

use core::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    BatchId, LedgerError, LedgerResult, LocationId, ProductId, SupplierId, UserId,
    VariantId,
};

use crate::history::{BatchHistoryEntry, ChangeType};
use crate::ledger::LedgerChange;

/// A received lot of a product sharing expiry, cost and supplier.
///
/// Invariant: `0 <= current_quantity <= initial_quantity`. The row is kept
/// after it is exhausted so its history stays reportable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: Option<LocationId>,
    pub batch_number: String,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
    pub initial_quantity: i64,
    pub current_quantity: i64,
    /// Cost per unit in the smallest currency unit (e.g. cents).
    pub unit_cost: i64,
    pub supplier_id: Option<SupplierId>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Row version, bumped on every quantity change.
    pub version: u64,
}

/// Input: create a batch at receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: Option<LocationId>,
    pub batch_number: String,
    pub initial_quantity: i64,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
    pub unit_cost: i64,
    pub supplier_id: Option<SupplierId>,
    pub received_at: DateTime<Utc>,
}

impl NewBatch {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.initial_quantity <= 0 {
            return Err(LedgerError::invalid_quantity(
                "initial quantity must be positive",
            ));
        }
        if self.unit_cost < 0 {
            return Err(LedgerError::invalid_quantity("unit cost cannot be negative"));
        }
        if self.batch_number.trim().is_empty() {
            return Err(LedgerError::validation("batch number cannot be empty"));
        }
        if let (Some(made), Some(expires)) = (self.manufacturing_date, self.expiry_date) {
            if made > expires {
                return Err(LedgerError::validation(
                    "manufacturing date is after expiry date",
                ));
            }
        }
        Ok(())
    }

    pub fn into_batch(self) -> Batch {
        Batch {
            id: self.batch_id,
            product_id: self.product_id,
            variant_id: self.variant_id,
            location_id: self.location_id,
            batch_number: self.batch_number,
            expiry_date: self.expiry_date,
            manufacturing_date: self.manufacturing_date,
            initial_quantity: self.initial_quantity,
            current_quantity: self.initial_quantity,
            unit_cost: self.unit_cost,
            supplier_id: self.supplier_id,
            active: true,
            created_at: self.received_at,
            version: 1,
        }
    }
}

/// Expiry component of the depletion order.
///
/// `Never` sorts after every date, so undated stock is consumed last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExpiryKey {
    On(NaiveDate),
    Never,
}

impl From<Option<NaiveDate>> for ExpiryKey {
    fn from(value: Option<NaiveDate>) -> Self {
        match value {
            Some(d) => ExpiryKey::On(d),
            None => ExpiryKey::Never,
        }
    }
}

/// Total depletion order: expiry (FEFO), then receipt time (FIFO), then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FefoKey {
    pub expiry: ExpiryKey,
    pub received_at: DateTime<Utc>,
    pub batch_id: BatchId,
}

impl Batch {
    pub fn fefo_key(&self) -> FefoKey {
        FefoKey {
            expiry: self.expiry_date.into(),
            received_at: self.created_at,
            batch_id: self.id,
        }
    }

    /// Active with stock on hand.
    pub fn is_allocatable(&self) -> bool {
        self.active && self.current_quantity > 0
    }

    pub fn is_within_bounds(&self) -> bool {
        0 <= self.current_quantity && self.current_quantity <= self.initial_quantity
    }

    /// Check a quantity change against the batch bounds and return the new
    /// quantity without mutating.
    pub fn check_change(&self, delta: i64) -> LedgerResult<i64> {
        if delta == 0 {
            return Err(LedgerError::invalid_quantity("batch delta cannot be zero"));
        }
        let next = self.current_quantity.checked_add(delta).ok_or_else(|| {
            LedgerError::invalid_quantity(format!(
                "batch {} quantity out of range",
                self.batch_number
            ))
        })?;
        if next < 0 {
            return Err(LedgerError::invalid_quantity(format!(
                "batch {} holds {} units, cannot remove {}",
                self.batch_number,
                self.current_quantity,
                delta.unsigned_abs()
            )));
        }
        if next > self.initial_quantity {
            return Err(LedgerError::invalid_quantity(format!(
                "batch {} cannot exceed its initial quantity {}",
                self.batch_number, self.initial_quantity
            )));
        }
        Ok(next)
    }

    /// Apply a checked change and bump the row version.
    pub fn apply_change(&mut self, delta: i64) -> LedgerResult<(i64, i64)> {
        let previous = self.current_quantity;
        let next = self.check_change(delta)?;
        self.current_quantity = next;
        self.version += 1;
        Ok((previous, next))
    }
}

/// Command: correct one batch outside an allocation (count corrections,
/// write-offs, restocks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustBatch {
    pub batch_id: BatchId,
    pub delta: i64,
    pub change_type: ChangeType,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl AdjustBatch {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.delta == 0 {
            return Err(LedgerError::invalid_quantity("batch delta cannot be zero"));
        }
        match self.change_type {
            ChangeType::Sale | ChangeType::TransferOut => Err(LedgerError::validation(format!(
                "{} changes are made by allocation",
                self.change_type
            ))),
            ChangeType::TransferIn if self.delta < 0 => Err(LedgerError::invalid_quantity(
                "transfer_in must add stock",
            )),
            ChangeType::ExpiryLoss | ChangeType::Damage if self.delta > 0 => Err(
                LedgerError::invalid_quantity(format!("{} must remove stock", self.change_type)),
            ),
            _ => Ok(()),
        }
    }

    /// History row for this change, from the `(previous, new)` pair returned
    /// by [`Batch::apply_change`].
    pub fn history_entry(&self, (previous, new): (i64, i64)) -> BatchHistoryEntry {
        BatchHistoryEntry::record(
            self.batch_id,
            previous,
            new,
            self.change_type,
            self.reference.clone(),
            self.actor,
            self.occurred_at,
        )
    }
}

/// Result of a committed batch correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAdjustment {
    pub batch: Batch,
    pub entry: BatchHistoryEntry,
    /// Present when the batch is stored at a location.
    pub ledger: Option<LedgerChange>,
}

/// Compare two batches by depletion order.
pub fn fefo_cmp(a: &Batch, b: &Batch) -> Ordering {
    a.fefo_key().cmp(&b.fefo_key())
}

/// Sort batches into depletion order.
pub fn sort_fefo(batches: &mut [Batch]) {
    batches.sort_by_key(Batch::fefo_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn batch(number: &str, expiry: Option<NaiveDate>, received_offset_secs: i64, qty: i64) -> Batch {
        NewBatch {
            batch_id: BatchId::new(),
            product_id: ProductId::new(),
            variant_id: None,
            location_id: None,
            batch_number: number.to_string(),
            initial_quantity: qty,
            expiry_date: expiry,
            manufacturing_date: None,
            unit_cost: 100,
            supplier_id: None,
            received_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::seconds(received_offset_secs),
        }
        .into_batch()
    }

    #[test]
    fn undated_batches_sort_last_regardless_of_receipt() {
        let mut batches = vec![
            batch("NONE", None, 0, 5),
            batch("MAR", Some(date(2024, 3, 1)), 10, 5),
            batch("JAN", Some(date(2024, 1, 1)), 30, 5),
            batch("FEB", Some(date(2024, 2, 1)), 20, 5),
        ];
        sort_fefo(&mut batches);
        let order: Vec<_> = batches.iter().map(|b| b.batch_number.as_str()).collect();
        assert_eq!(order, vec!["JAN", "FEB", "MAR", "NONE"]);
    }

    #[test]
    fn same_expiry_falls_back_to_receipt_order() {
        let expiry = Some(date(2024, 6, 1));
        let mut batches = vec![batch("LATE", expiry, 50, 5), batch("EARLY", expiry, 5, 5)];
        sort_fefo(&mut batches);
        assert_eq!(batches[0].batch_number, "EARLY");
    }

    #[test]
    fn new_batch_starts_full_and_active() {
        let b = batch("B1", None, 0, 12);
        assert_eq!(b.current_quantity, 12);
        assert!(b.active);
        assert!(b.is_allocatable());
        assert_eq!(b.version, 1);
    }

    #[test]
    fn validation_rejects_bad_input() {
        let mut input = NewBatch {
            batch_id: BatchId::new(),
            product_id: ProductId::new(),
            variant_id: None,
            location_id: None,
            batch_number: "B1".to_string(),
            initial_quantity: 0,
            expiry_date: Some(date(2024, 1, 1)),
            manufacturing_date: Some(date(2023, 1, 1)),
            unit_cost: 10,
            supplier_id: None,
            received_at: Utc::now(),
        };
        assert!(matches!(input.validate(), Err(LedgerError::InvalidQuantity(_))));

        input.initial_quantity = 10;
        assert!(input.validate().is_ok());

        input.manufacturing_date = Some(date(2025, 1, 1));
        assert!(matches!(input.validate(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn changes_stay_within_bounds() {
        let mut b = batch("B1", None, 0, 10);
        assert_eq!(b.apply_change(-4).unwrap(), (10, 6));
        assert_eq!(b.version, 2);
        assert!(b.check_change(-7).is_err());
        assert!(b.check_change(5).is_err());
        assert_eq!(b.apply_change(4).unwrap(), (6, 10));
        assert!(b.is_within_bounds());
    }

    #[test]
    fn adjustments_are_typed_by_direction() {
        let b = batch("B1", None, 0, 10);
        let adjust = |delta, change_type| AdjustBatch {
            batch_id: b.id,
            delta,
            change_type,
            reference: None,
            actor: None,
            occurred_at: Utc::now(),
        };
        assert!(adjust(-2, ChangeType::Damage).validate().is_ok());
        assert!(adjust(3, ChangeType::Adjustment).validate().is_ok());
        assert!(adjust(-3, ChangeType::Adjustment).validate().is_ok());
        assert!(adjust(1, ChangeType::TransferIn).validate().is_ok());
        assert!(matches!(
            adjust(2, ChangeType::ExpiryLoss).validate(),
            Err(LedgerError::InvalidQuantity(_))
        ));
        assert!(matches!(
            adjust(-1, ChangeType::TransferIn).validate(),
            Err(LedgerError::InvalidQuantity(_))
        ));
        assert!(matches!(
            adjust(-1, ChangeType::Sale).validate(),
            Err(LedgerError::Validation(_))
        ));

        let mut damaged = b.clone();
        let cmd = adjust(-2, ChangeType::Damage);
        let entry = cmd.history_entry(damaged.apply_change(cmd.delta).unwrap());
        assert_eq!((entry.previous_quantity, entry.new_quantity), (10, 8));
        assert_eq!(entry.quantity_change, -2);
        assert_eq!(entry.batch_id, b.id);
    }

    #[test]
    fn extreme_deltas_are_invalid_quantities() {
        let mut b = batch("B1", None, 0, 10);
        for delta in [i64::MAX, i64::MIN, i64::MIN + 1] {
            assert!(matches!(
                b.apply_change(delta),
                Err(LedgerError::InvalidQuantity(_))
            ));
        }
        assert_eq!(b.current_quantity, 10);
        assert_eq!(b.version, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: sorted order never places a later expiry before an earlier
        /// one, and every undated batch comes after every dated batch.
        #[test]
        fn sorted_order_is_fefo(
            specs in prop::collection::vec((prop::option::of(0i64..400), 0i64..10_000), 1..25)
        ) {
            let base = date(2024, 1, 1);
            let mut batches: Vec<Batch> = specs
                .iter()
                .enumerate()
                .map(|(i, (days, offset))| {
                    batch(&format!("B{i}"), days.map(|d| base + Duration::days(d)), *offset, 1)
                })
                .collect();
            sort_fefo(&mut batches);

            for pair in batches.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(fefo_cmp(a, b) != Ordering::Greater);
                match (a.expiry_date, b.expiry_date) {
                    (Some(x), Some(y)) => prop_assert!(x <= y),
                    (None, Some(_)) => prop_assert!(false, "undated batch sorted before dated one"),
                    _ => {}
                }
            }
        }
    }
}

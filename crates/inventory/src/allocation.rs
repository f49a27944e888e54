//! FEFO/FIFO allocation planning.
//!
//! Allocation is two-phase: [`AllocationPlan::build`] computes the complete
//! set of batch draws against a snapshot of candidate batches, and fails with
//! `InsufficientStock` before anything is written when the snapshot cannot
//! cover the request. The storage layer then commits the plan atomically,
//! checking each draw's expected row version.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    BatchId, LedgerError, LedgerResult, LocationId, ProductId, SupplierId, UserId, VariantId,
};

use crate::batch::{Batch, NewBatch, sort_fefo};
use crate::history::{BatchHistoryEntry, ChangeType};
use crate::ledger::{LedgerChange, TransferOutcome};

/// Command: deplete batches at a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub quantity_needed: i64,
    pub change_type: ChangeType,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl AllocationRequest {
    /// A sale allocation (the default change type).
    pub fn sale(
        product_id: ProductId,
        location_id: LocationId,
        quantity_needed: i64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            product_id,
            location_id,
            quantity_needed,
            change_type: ChangeType::Sale,
            reference: None,
            actor: None,
            occurred_at,
        }
    }

    pub fn with_change_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = change_type;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.quantity_needed <= 0 {
            return Err(LedgerError::invalid_quantity(
                "quantity needed must be positive",
            ));
        }
        if self.change_type == ChangeType::TransferIn {
            return Err(LedgerError::validation(
                "transfer_in cannot be used to deplete batches",
            ));
        }
        Ok(())
    }
}

/// One planned draw against one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDraw {
    pub batch_id: BatchId,
    pub batch_number: String,
    pub variant_id: Option<VariantId>,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
    pub supplier_id: Option<SupplierId>,
    pub unit_cost: i64,
    pub previous_quantity: i64,
    pub quantity: i64,
    /// Row version observed when planning; the commit must still see it.
    pub expected_version: u64,
}

impl PlannedDraw {
    pub fn new_quantity(&self) -> i64 {
        self.previous_quantity - self.quantity
    }
}

/// Complete, all-or-nothing allocation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub requested: i64,
    pub draws: Vec<PlannedDraw>,
}

impl AllocationPlan {
    /// Plan a request against candidate batches.
    ///
    /// Candidates not matching the product/location, inactive, or empty are
    /// ignored. The rest are walked in FEFO order.
    pub fn build(request: &AllocationRequest, candidates: &[Batch]) -> LedgerResult<Self> {
        request.validate()?;

        let mut eligible: Vec<Batch> = candidates
            .iter()
            .filter(|b| {
                b.product_id == request.product_id
                    && b.location_id == Some(request.location_id)
                    && b.is_allocatable()
            })
            .cloned()
            .collect();
        sort_fefo(&mut eligible);

        let available: i64 = eligible.iter().map(|b| b.current_quantity).sum();
        if available < request.quantity_needed {
            return Err(LedgerError::insufficient_stock(
                request.product_id,
                request.location_id,
                request.quantity_needed,
                available,
            ));
        }

        let mut remaining = request.quantity_needed;
        let mut draws = Vec::new();
        for batch in eligible {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(batch.current_quantity);
            remaining -= take;
            draws.push(PlannedDraw {
                batch_id: batch.id,
                batch_number: batch.batch_number,
                variant_id: batch.variant_id,
                expiry_date: batch.expiry_date,
                manufacturing_date: batch.manufacturing_date,
                supplier_id: batch.supplier_id,
                unit_cost: batch.unit_cost,
                previous_quantity: batch.current_quantity,
                quantity: take,
                expected_version: batch.version,
            });
        }

        Ok(Self {
            product_id: request.product_id,
            location_id: request.location_id,
            requested: request.quantity_needed,
            draws,
        })
    }

    pub fn fulfilled(&self) -> i64 {
        self.draws.iter().map(|d| d.quantity).sum()
    }

    pub fn lines(&self) -> Vec<AllocationLine> {
        self.draws
            .iter()
            .map(|d| AllocationLine {
                batch_id: d.batch_id,
                batch_number: d.batch_number.clone(),
                quantity: d.quantity,
                unit_cost: d.unit_cost,
                expiry_date: d.expiry_date,
            })
            .collect()
    }

    /// History rows documenting the draws, one per batch touched.
    pub fn history_entries(&self, request: &AllocationRequest) -> Vec<BatchHistoryEntry> {
        self.draws
            .iter()
            .map(|d| {
                BatchHistoryEntry::record(
                    d.batch_id,
                    d.previous_quantity,
                    d.previous_quantity - d.quantity,
                    request.change_type,
                    request.reference.clone(),
                    request.actor,
                    request.occurred_at,
                )
            })
            .collect()
    }
}

/// One line of a committed allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub batch_id: BatchId,
    pub batch_number: String,
    pub quantity: i64,
    pub unit_cost: i64,
    pub expiry_date: Option<NaiveDate>,
}

/// Result of a committed allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub lines: Vec<AllocationLine>,
    pub fulfilled: i64,
    pub ledger: LedgerChange,
}

impl Allocation {
    /// Cost of the allocated goods in minor currency units.
    pub fn total_cost(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity * l.unit_cost).sum()
    }
}

/// Command: move batch-tracked stock between locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTransfer {
    pub product_id: ProductId,
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub quantity: i64,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl BatchTransfer {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.from_location == self.to_location {
            return Err(LedgerError::invalid_quantity(
                "transfer source and destination must differ",
            ));
        }
        Ok(())
    }

    /// The source-side allocation request.
    pub fn source_request(&self) -> AllocationRequest {
        AllocationRequest {
            product_id: self.product_id,
            location_id: self.from_location,
            quantity_needed: self.quantity,
            change_type: ChangeType::TransferOut,
            reference: self.reference.clone(),
            actor: self.actor,
            occurred_at: self.occurred_at,
        }
    }

    /// Destination batches mirroring each source draw.
    pub fn destination_batches(&self, plan: &AllocationPlan) -> Vec<NewBatch> {
        plan.draws
            .iter()
            .map(|d| NewBatch {
                batch_id: BatchId::new(),
                product_id: self.product_id,
                variant_id: d.variant_id,
                location_id: Some(self.to_location),
                batch_number: d.batch_number.clone(),
                initial_quantity: d.quantity,
                expiry_date: d.expiry_date,
                manufacturing_date: d.manufacturing_date,
                unit_cost: d.unit_cost,
                supplier_id: d.supplier_id,
                received_at: self.occurred_at,
            })
            .collect()
    }
}

/// Result of a committed batch transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTransferOutcome {
    pub lines: Vec<AllocationLine>,
    pub destination_batches: Vec<Batch>,
    pub ledger: TransferOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn batch_at(
        product_id: ProductId,
        location_id: LocationId,
        number: &str,
        expiry: Option<NaiveDate>,
        qty: i64,
        received_offset_secs: i64,
    ) -> Batch {
        NewBatch {
            batch_id: BatchId::new(),
            product_id,
            variant_id: None,
            location_id: Some(location_id),
            batch_number: number.to_string(),
            initial_quantity: qty,
            expiry_date: expiry,
            manufacturing_date: None,
            unit_cost: 150,
            supplier_id: None,
            received_at: t0() + Duration::seconds(received_offset_secs),
        }
        .into_batch()
    }

    #[test]
    fn earliest_expiry_is_exhausted_first() {
        let product_id = ProductId::new();
        let location_id = LocationId::new();
        let a = batch_at(product_id, location_id, "A", Some(date(2024, 1, 1)), 5, 10);
        let b = batch_at(product_id, location_id, "B", Some(date(2024, 2, 1)), 5, 0);

        let request = AllocationRequest::sale(product_id, location_id, 7, t0());
        let plan = AllocationPlan::build(&request, &[b.clone(), a.clone()]).unwrap();

        let drawn: Vec<_> = plan.draws.iter().map(|d| (d.batch_number.as_str(), d.quantity)).collect();
        assert_eq!(drawn, vec![("A", 5), ("B", 2)]);
        assert_eq!(plan.fulfilled(), 7);
        assert_eq!(plan.draws[0].new_quantity(), 0);
        assert_eq!(plan.draws[1].new_quantity(), 3);
    }

    #[test]
    fn over_request_fails_without_a_partial_plan() {
        let product_id = ProductId::new();
        let location_id = LocationId::new();
        let a = batch_at(product_id, location_id, "A", None, 4, 0);

        let request = AllocationRequest::sale(product_id, location_id, 5, t0());
        let err = AllocationPlan::build(&request, &[a]).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                product_id,
                location_id,
                requested: 5,
                available: 4,
            }
        );
    }

    #[test]
    fn other_locations_and_inactive_batches_are_ignored() {
        let product_id = ProductId::new();
        let here = LocationId::new();
        let mut inactive = batch_at(product_id, here, "OLD", Some(date(2023, 1, 1)), 10, 0);
        inactive.active = false;
        let elsewhere = batch_at(product_id, LocationId::new(), "FAR", Some(date(2023, 6, 1)), 10, 0);
        let local = batch_at(product_id, here, "LOCAL", None, 10, 0);

        let request = AllocationRequest::sale(product_id, here, 3, t0());
        let plan = AllocationPlan::build(&request, &[inactive, elsewhere, local]).unwrap();
        assert_eq!(plan.draws.len(), 1);
        assert_eq!(plan.draws[0].batch_number, "LOCAL");
    }

    #[test]
    fn history_entries_are_consistent_and_typed() {
        let product_id = ProductId::new();
        let location_id = LocationId::new();
        let a = batch_at(product_id, location_id, "A", None, 10, 0);
        let request = AllocationRequest::sale(product_id, location_id, 4, t0())
            .with_change_type(ChangeType::Damage)
            .with_reference("writeoff-17");
        let plan = AllocationPlan::build(&request, &[a]).unwrap();

        let entries = plan.history_entries(&request);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_consistent());
        assert_eq!(entries[0].quantity_change, -4);
        assert_eq!(entries[0].change_type, ChangeType::Damage);
        assert_eq!(entries[0].reference.as_deref(), Some("writeoff-17"));
    }

    #[test]
    fn transfer_in_cannot_deplete() {
        let request = AllocationRequest::sale(ProductId::new(), LocationId::new(), 1, t0())
            .with_change_type(ChangeType::TransferIn);
        assert!(matches!(request.validate(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn total_cost_sums_lines() {
        let allocation = Allocation {
            lines: vec![
                AllocationLine {
                    batch_id: BatchId::new(),
                    batch_number: "A".into(),
                    quantity: 5,
                    unit_cost: 100,
                    expiry_date: None,
                },
                AllocationLine {
                    batch_id: BatchId::new(),
                    batch_number: "B".into(),
                    quantity: 2,
                    unit_cost: 130,
                    expiry_date: None,
                },
            ],
            fulfilled: 7,
            ledger: LedgerChange {
                product_id: ProductId::new(),
                location_id: LocationId::new(),
                previous_quantity: 10,
                new_quantity: 3,
                previous_total: 10,
                new_total: 3,
            },
        };
        assert_eq!(allocation.total_cost(), 760);
    }

    #[test]
    fn destination_batches_mirror_source_draws() {
        let product_id = ProductId::new();
        let from = LocationId::new();
        let to = LocationId::new();
        let a = batch_at(product_id, from, "A", Some(date(2024, 5, 1)), 6, 0);
        let transfer = BatchTransfer {
            product_id,
            from_location: from,
            to_location: to,
            quantity: 4,
            reference: None,
            actor: None,
            occurred_at: t0(),
        };
        let plan = AllocationPlan::build(&transfer.source_request(), &[a]).unwrap();
        let dest = transfer.destination_batches(&plan);
        assert_eq!(dest.len(), 1);
        assert_eq!(dest[0].location_id, Some(to));
        assert_eq!(dest[0].initial_quantity, 4);
        assert_eq!(dest[0].batch_number, "A");
        assert_eq!(dest[0].expiry_date, Some(date(2024, 5, 1)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: planning is deterministic and never draws more than a batch
        /// holds; exact requests drain every eligible batch.
        #[test]
        fn plans_are_deterministic_and_bounded(
            specs in prop::collection::vec((prop::option::of(0i64..90), 1i64..50), 1..12),
            fraction in 1u32..=100
        ) {
            let product_id = ProductId::new();
            let location_id = LocationId::new();
            let base = date(2024, 1, 1);
            let batches: Vec<Batch> = specs
                .iter()
                .enumerate()
                .map(|(i, (days, qty))| {
                    batch_at(product_id, location_id, &format!("B{i}"), days.map(|d| base + Duration::days(d)), *qty, i as i64)
                })
                .collect();
            let available: i64 = batches.iter().map(|b| b.current_quantity).sum();
            let wanted = ((available * fraction as i64) / 100).max(1);

            let request = AllocationRequest::sale(product_id, location_id, wanted, t0());
            let first = AllocationPlan::build(&request, &batches).unwrap();
            let second = AllocationPlan::build(&request, &batches).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.fulfilled(), wanted);
            for d in &first.draws {
                prop_assert!(d.quantity > 0);
                prop_assert!(d.quantity <= d.previous_quantity);
            }
            // Every draw except possibly the last one empties its batch.
            for d in first.draws.iter().rev().skip(1) {
                prop_assert_eq!(d.new_quantity(), 0);
            }

            let exact = AllocationRequest::sale(product_id, location_id, available, t0());
            let drained = AllocationPlan::build(&exact, &batches).unwrap();
            prop_assert_eq!(drained.draws.len(), batches.len());
            prop_assert!(drained.draws.iter().all(|d| d.new_quantity() == 0));
        }
    }
}

//! Storage boundary for the ledger tables.
//!
//! The store is the single writer to products, locations, stock levels,
//! movements, batches, batch history and serial numbers. Each write method is
//! one transaction: it either applies every row change it implies (ledger
//! reconciliation and history rows included) or none of them.
//!
//! Domain validation lives in `stockledger-inventory`; implementations call it
//! against the rows they hold inside the transaction.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use stockledger_core::{
    BatchId, ExpectedVersion, LedgerError, LedgerResult, LocationId, ProductId, SerialNumberId,
    UserId,
};
use stockledger_inventory::{
    AdjustBatch, AdjustQuantity, Allocation, AllocationPlan, AllocationRequest, Batch,
    BatchAdjustment, BatchHistoryEntry, BatchTransfer, BatchTransferOutcome, ChangeSerialStatus,
    CreateSerialNumbers, ExpiringBatch, LedgerChange, Location, LowStockItem, MovementReason,
    NewBatch, NewLocation, NewProduct, Product, SerialNumber, SerialStatus, SerialTransition,
    StockLevel, StockMovement, TransferOutcome, TransferQuantity,
};

/// Who/why/when of a ledger write.
#[derive(Debug, Clone)]
pub(crate) struct Provenance {
    pub reason: MovementReason,
    pub reference: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Reject plans that do not belong to their request or do not cover it.
pub(crate) fn check_plan(plan: &AllocationPlan, request: &AllocationRequest) -> LedgerResult<()> {
    request.validate()?;
    if plan.product_id != request.product_id
        || plan.location_id != request.location_id
        || plan.requested != request.quantity_needed
    {
        return Err(LedgerError::validation(
            "allocation plan does not match its request",
        ));
    }
    let mut seen = HashSet::with_capacity(plan.draws.len());
    let mut fulfilled: i64 = 0;
    for draw in &plan.draws {
        if !seen.insert(draw.batch_id) {
            return Err(LedgerError::validation(format!(
                "batch {} is drawn more than once",
                draw.batch_number
            )));
        }
        if draw.quantity <= 0 {
            return Err(LedgerError::invalid_quantity(format!(
                "draw from batch {} must be positive",
                draw.batch_number
            )));
        }
        fulfilled = fulfilled
            .checked_add(draw.quantity)
            .ok_or_else(|| LedgerError::invalid_quantity("allocation plan total overflows"))?;
    }
    if fulfilled != plan.requested {
        return Err(LedgerError::insufficient_stock(
            plan.product_id,
            plan.location_id,
            plan.requested,
            fulfilled,
        ));
    }
    Ok(())
}

/// Check every draw of a plan against the batch row as stored now and return
/// the rows as they will be once the plan is applied.
///
/// A batch of another product or location is a `Validation` error. A row
/// whose version moved since planning, or that was deactivated, is a
/// `ConcurrencyConflict`.
pub(crate) fn stage_draws(
    plan: &AllocationPlan,
    mut current: impl FnMut(BatchId) -> LedgerResult<Batch>,
) -> LedgerResult<Vec<Batch>> {
    plan.draws
        .iter()
        .map(|d| {
            let mut batch = current(d.batch_id)?;
            if batch.product_id != plan.product_id || batch.location_id != Some(plan.location_id) {
                return Err(LedgerError::validation(format!(
                    "batch {} does not hold this product at this location",
                    batch.batch_number
                )));
            }
            ExpectedVersion::Exact(d.expected_version).check(batch.version)?;
            if batch.current_quantity != d.previous_quantity {
                return Err(LedgerError::conflict(format!(
                    "batch {} changed since planning",
                    batch.batch_number
                )));
            }
            if !batch.active {
                return Err(LedgerError::conflict(format!(
                    "batch {} was deactivated",
                    batch.batch_number
                )));
            }
            batch.apply_change(-d.quantity)?;
            Ok(batch)
        })
        .collect()
}

/// Ledger persistence.
///
/// `allow_negative` parameters carry the configured negative-stock policy into
/// the ledger write of the operation.
#[async_trait::async_trait]
pub trait InventoryStore: Send + Sync {
    // Registry

    async fn register_product(&self, product: NewProduct) -> LedgerResult<Product>;

    /// Registering a primary location demotes the previous primary.
    async fn register_location(&self, location: NewLocation) -> LedgerResult<Location>;

    async fn get_product(&self, product_id: ProductId) -> LedgerResult<Product>;

    async fn get_location(&self, location_id: LocationId) -> LedgerResult<Location>;

    /// Ordered by name.
    async fn list_locations(&self) -> LedgerResult<Vec<Location>>;

    async fn low_stock_products(&self) -> LedgerResult<Vec<LowStockItem>>;

    // Location ledger

    async fn adjust_quantity(
        &self,
        cmd: AdjustQuantity,
        allow_negative: bool,
    ) -> LedgerResult<LedgerChange>;

    async fn transfer_quantity(
        &self,
        cmd: TransferQuantity,
        allow_negative: bool,
    ) -> LedgerResult<TransferOutcome>;

    /// Zero when no row exists.
    async fn quantity_at(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<i64>;

    /// Cached product total; zero for unknown products.
    async fn total_quantity(&self, product_id: ProductId) -> LedgerResult<i64>;

    async fn list_stock_levels(&self, product_id: ProductId) -> LedgerResult<Vec<StockLevel>>;

    /// Movements for one pair in append order.
    async fn movement_history(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<StockMovement>>;

    /// Remove a location with its stock levels, reconcile affected totals and
    /// deactivate its batches. Returns one change per removed level.
    async fn delete_location(&self, location_id: LocationId) -> LedgerResult<Vec<LedgerChange>>;

    // Batches

    async fn create_batch(&self, batch: NewBatch) -> LedgerResult<Batch>;

    /// Create a batch and credit its location in the ledger.
    async fn receive_batch(
        &self,
        batch: NewBatch,
        actor: Option<UserId>,
    ) -> LedgerResult<(Batch, LedgerChange)>;

    async fn get_batch(&self, batch_id: BatchId) -> LedgerResult<Batch>;

    /// All batches of a product in depletion order.
    async fn list_batches(&self, product_id: ProductId) -> LedgerResult<Vec<Batch>>;

    async fn has_active_batches(&self, product_id: ProductId) -> LedgerResult<bool>;

    /// Consistent snapshot of the batches an allocation may draw from.
    async fn allocation_candidates(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<Batch>>;

    /// Commit a plan built from [`InventoryStore::allocation_candidates`].
    ///
    /// Fails with `ConcurrencyConflict` when any planned batch changed since
    /// the snapshot.
    async fn commit_allocation(
        &self,
        plan: &AllocationPlan,
        request: &AllocationRequest,
        allow_negative: bool,
    ) -> LedgerResult<Allocation>;

    async fn adjust_batch(
        &self,
        cmd: AdjustBatch,
        allow_negative: bool,
    ) -> LedgerResult<BatchAdjustment>;

    /// Commit a source-side plan and create the mirrored destination batches.
    async fn commit_batch_transfer(
        &self,
        transfer: &BatchTransfer,
        plan: &AllocationPlan,
        allow_negative: bool,
    ) -> LedgerResult<BatchTransferOutcome>;

    /// History of one batch in append order.
    async fn batch_history(&self, batch_id: BatchId) -> LedgerResult<Vec<BatchHistoryEntry>>;

    /// Every active, dated batch with stock, classified and ordered by expiry.
    async fn expiry_report(
        &self,
        today: NaiveDate,
        threshold_days: u32,
    ) -> LedgerResult<Vec<ExpiringBatch>>;

    // Serial numbers

    async fn create_serial_numbers(
        &self,
        cmd: CreateSerialNumbers,
    ) -> LedgerResult<Vec<SerialNumber>>;

    async fn transition_serial(&self, cmd: ChangeSerialStatus) -> LedgerResult<SerialTransition>;

    async fn get_serial(&self, serial_id: SerialNumberId) -> LedgerResult<SerialNumber>;

    async fn find_serial(
        &self,
        product_id: ProductId,
        serial_number: &str,
    ) -> LedgerResult<Option<SerialNumber>>;

    /// Ordered by serial string.
    async fn list_serials(
        &self,
        product_id: ProductId,
        status: Option<SerialStatus>,
    ) -> LedgerResult<Vec<SerialNumber>>;
}

#[async_trait::async_trait]
impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    async fn register_product(&self, product: NewProduct) -> LedgerResult<Product> {
        (**self).register_product(product).await
    }

    async fn register_location(&self, location: NewLocation) -> LedgerResult<Location> {
        (**self).register_location(location).await
    }

    async fn get_product(&self, product_id: ProductId) -> LedgerResult<Product> {
        (**self).get_product(product_id).await
    }

    async fn get_location(&self, location_id: LocationId) -> LedgerResult<Location> {
        (**self).get_location(location_id).await
    }

    async fn list_locations(&self) -> LedgerResult<Vec<Location>> {
        (**self).list_locations().await
    }

    async fn low_stock_products(&self) -> LedgerResult<Vec<LowStockItem>> {
        (**self).low_stock_products().await
    }

    async fn adjust_quantity(
        &self,
        cmd: AdjustQuantity,
        allow_negative: bool,
    ) -> LedgerResult<LedgerChange> {
        (**self).adjust_quantity(cmd, allow_negative).await
    }

    async fn transfer_quantity(
        &self,
        cmd: TransferQuantity,
        allow_negative: bool,
    ) -> LedgerResult<TransferOutcome> {
        (**self).transfer_quantity(cmd, allow_negative).await
    }

    async fn quantity_at(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<i64> {
        (**self).quantity_at(product_id, location_id).await
    }

    async fn total_quantity(&self, product_id: ProductId) -> LedgerResult<i64> {
        (**self).total_quantity(product_id).await
    }

    async fn list_stock_levels(&self, product_id: ProductId) -> LedgerResult<Vec<StockLevel>> {
        (**self).list_stock_levels(product_id).await
    }

    async fn movement_history(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<StockMovement>> {
        (**self).movement_history(product_id, location_id).await
    }

    async fn delete_location(&self, location_id: LocationId) -> LedgerResult<Vec<LedgerChange>> {
        (**self).delete_location(location_id).await
    }

    async fn create_batch(&self, batch: NewBatch) -> LedgerResult<Batch> {
        (**self).create_batch(batch).await
    }

    async fn receive_batch(
        &self,
        batch: NewBatch,
        actor: Option<UserId>,
    ) -> LedgerResult<(Batch, LedgerChange)> {
        (**self).receive_batch(batch, actor).await
    }

    async fn get_batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        (**self).get_batch(batch_id).await
    }

    async fn list_batches(&self, product_id: ProductId) -> LedgerResult<Vec<Batch>> {
        (**self).list_batches(product_id).await
    }

    async fn has_active_batches(&self, product_id: ProductId) -> LedgerResult<bool> {
        (**self).has_active_batches(product_id).await
    }

    async fn allocation_candidates(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<Batch>> {
        (**self).allocation_candidates(product_id, location_id).await
    }

    async fn commit_allocation(
        &self,
        plan: &AllocationPlan,
        request: &AllocationRequest,
        allow_negative: bool,
    ) -> LedgerResult<Allocation> {
        (**self).commit_allocation(plan, request, allow_negative).await
    }

    async fn adjust_batch(
        &self,
        cmd: AdjustBatch,
        allow_negative: bool,
    ) -> LedgerResult<BatchAdjustment> {
        (**self).adjust_batch(cmd, allow_negative).await
    }

    async fn commit_batch_transfer(
        &self,
        transfer: &BatchTransfer,
        plan: &AllocationPlan,
        allow_negative: bool,
    ) -> LedgerResult<BatchTransferOutcome> {
        (**self)
            .commit_batch_transfer(transfer, plan, allow_negative)
            .await
    }

    async fn batch_history(&self, batch_id: BatchId) -> LedgerResult<Vec<BatchHistoryEntry>> {
        (**self).batch_history(batch_id).await
    }

    async fn expiry_report(
        &self,
        today: NaiveDate,
        threshold_days: u32,
    ) -> LedgerResult<Vec<ExpiringBatch>> {
        (**self).expiry_report(today, threshold_days).await
    }

    async fn create_serial_numbers(
        &self,
        cmd: CreateSerialNumbers,
    ) -> LedgerResult<Vec<SerialNumber>> {
        (**self).create_serial_numbers(cmd).await
    }

    async fn transition_serial(&self, cmd: ChangeSerialStatus) -> LedgerResult<SerialTransition> {
        (**self).transition_serial(cmd).await
    }

    async fn get_serial(&self, serial_id: SerialNumberId) -> LedgerResult<SerialNumber> {
        (**self).get_serial(serial_id).await
    }

    async fn find_serial(
        &self,
        product_id: ProductId,
        serial_number: &str,
    ) -> LedgerResult<Option<SerialNumber>> {
        (**self).find_serial(product_id, serial_number).await
    }

    async fn list_serials(
        &self,
        product_id: ProductId,
        status: Option<SerialStatus>,
    ) -> LedgerResult<Vec<SerialNumber>> {
        (**self).list_serials(product_id, status).await
    }
}

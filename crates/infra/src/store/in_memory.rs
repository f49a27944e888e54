use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{NaiveDate, Utc};

use stockledger_core::{
    BatchId, LedgerError, LedgerResult, LocationId, ProductId, SerialNumberId, StockLevelId,
    UserId,
};
use stockledger_inventory::{
    AdjustBatch, AdjustQuantity, Allocation, AllocationPlan, AllocationRequest, Batch,
    BatchAdjustment, BatchHistoryEntry, BatchTransfer, BatchTransferOutcome, ChangeSerialStatus,
    CreateSerialNumbers, ExpiringBatch, LedgerChange, Location, LowStockItem, MovementReason,
    NewBatch, NewLocation, NewProduct, Product, SerialNumber, SerialStatus, SerialTransition,
    StockLevel, StockMovement, TransferOutcome, TransferQuantity, apply_delta, check_total,
    expiry_report,
    reconciled_total, sort_fefo,
};

use super::{InventoryStore, Provenance, check_plan, stage_draws};

#[derive(Debug, Default)]
struct Tables {
    products: HashMap<ProductId, Product>,
    locations: HashMap<LocationId, Location>,
    levels: HashMap<(ProductId, LocationId), StockLevel>,
    movements: Vec<StockMovement>,
    batches: HashMap<BatchId, Batch>,
    history: Vec<BatchHistoryEntry>,
    serials: HashMap<SerialNumberId, SerialNumber>,
}

/// A validated ledger write that has not been applied yet.
#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    product_id: ProductId,
    location_id: LocationId,
    previous: i64,
    next: i64,
}

impl Tables {
    fn product(&self, id: ProductId) -> LedgerResult<&Product> {
        self.products
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("product", id))
    }

    fn location(&self, id: LocationId) -> LedgerResult<&Location> {
        self.locations
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("location", id))
    }

    fn batch(&self, id: BatchId) -> LedgerResult<&Batch> {
        self.batches
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("batch", id))
    }

    fn level_quantity(&self, product_id: ProductId, location_id: LocationId) -> i64 {
        self.levels
            .get(&(product_id, location_id))
            .map(|l| l.quantity)
            .unwrap_or(0)
    }

    fn plan_write(
        &self,
        product_id: ProductId,
        location_id: LocationId,
        delta: i64,
        allow_negative: bool,
    ) -> LedgerResult<PendingWrite> {
        let total = self.product(product_id)?.total_quantity;
        self.location(location_id)?;
        let previous = self.level_quantity(product_id, location_id);
        let next = apply_delta(product_id, location_id, previous, delta, allow_negative)?;
        check_total(product_id, total, delta)?;
        Ok(PendingWrite {
            product_id,
            location_id,
            previous,
            next,
        })
    }

    /// Apply a planned write: upsert the level, log the movement, reconcile.
    fn commit_write(&mut self, write: PendingWrite, by: Provenance) -> LedgerChange {
        let key = (write.product_id, write.location_id);
        let level = self.levels.entry(key).or_insert_with(|| StockLevel {
            id: StockLevelId::new(),
            product_id: write.product_id,
            location_id: write.location_id,
            quantity: 0,
            updated_at: by.occurred_at,
        });
        level.quantity = write.next;
        level.updated_at = by.occurred_at;

        self.movements.push(StockMovement::record(
            write.product_id,
            write.location_id,
            write.previous,
            write.next - write.previous,
            by.reason,
            by.reference,
            by.actor,
            by.occurred_at,
        ));

        let (previous_total, new_total) = self.reconcile(write.product_id);
        LedgerChange {
            product_id: write.product_id,
            location_id: write.location_id,
            previous_quantity: write.previous,
            new_quantity: write.next,
            previous_total,
            new_total,
        }
    }

    /// Recompute the cached total from the level rows.
    fn reconcile(&mut self, product_id: ProductId) -> (i64, i64) {
        let total = reconciled_total(self.levels.values().filter(|l| l.product_id == product_id));
        match self.products.get_mut(&product_id) {
            Some(product) => {
                let previous = product.total_quantity;
                product.total_quantity = total;
                (previous, total)
            }
            None => (0, total),
        }
    }

    fn insert_batches(&mut self, batches: Vec<Batch>) {
        for batch in batches {
            self.batches.insert(batch.id, batch);
        }
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Writers are serialized behind one lock; every
/// write validates fully before touching any row, so a failed call leaves no
/// trace.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> LedgerResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| LedgerError::storage("lock poisoned"))
    }

    fn write(&self) -> LedgerResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| LedgerError::storage("lock poisoned"))
    }
}

#[async_trait::async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn register_product(&self, product: NewProduct) -> LedgerResult<Product> {
        product.validate()?;
        let mut t = self.write()?;
        if t.products.contains_key(&product.product_id) {
            return Err(LedgerError::validation(format!(
                "product {} already registered",
                product.product_id
            )));
        }
        if t.products.values().any(|p| p.sku == product.sku) {
            return Err(LedgerError::validation(format!(
                "sku '{}' already registered",
                product.sku
            )));
        }
        let product = product.into_product();
        t.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn register_location(&self, location: NewLocation) -> LedgerResult<Location> {
        location.validate()?;
        let mut t = self.write()?;
        if t.locations.contains_key(&location.location_id) {
            return Err(LedgerError::validation(format!(
                "location {} already registered",
                location.location_id
            )));
        }
        let location = location.into_location();
        if location.is_primary {
            for other in t.locations.values_mut() {
                other.is_primary = false;
            }
        }
        t.locations.insert(location.id, location.clone());
        Ok(location)
    }

    async fn get_product(&self, product_id: ProductId) -> LedgerResult<Product> {
        self.read()?.product(product_id).cloned()
    }

    async fn get_location(&self, location_id: LocationId) -> LedgerResult<Location> {
        self.read()?.location(location_id).cloned()
    }

    async fn list_locations(&self) -> LedgerResult<Vec<Location>> {
        let t = self.read()?;
        let mut locations: Vec<Location> = t.locations.values().cloned().collect();
        locations.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(locations)
    }

    async fn low_stock_products(&self) -> LedgerResult<Vec<LowStockItem>> {
        let t = self.read()?;
        let mut items: Vec<LowStockItem> = t
            .products
            .values()
            .filter(|p| p.is_low_stock())
            .map(LowStockItem::from)
            .collect();
        items.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(items)
    }

    async fn adjust_quantity(
        &self,
        cmd: AdjustQuantity,
        allow_negative: bool,
    ) -> LedgerResult<LedgerChange> {
        let mut t = self.write()?;
        let write = t.plan_write(cmd.product_id, cmd.location_id, cmd.delta, allow_negative)?;
        Ok(t.commit_write(
            write,
            Provenance {
                reason: cmd.reason,
                reference: cmd.reference,
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            },
        ))
    }

    async fn transfer_quantity(
        &self,
        cmd: TransferQuantity,
        allow_negative: bool,
    ) -> LedgerResult<TransferOutcome> {
        cmd.validate()?;
        let mut t = self.write()?;
        let out = t.plan_write(
            cmd.product_id,
            cmd.from_location,
            -cmd.quantity,
            allow_negative,
        )?;
        let into = t.plan_write(cmd.product_id, cmd.to_location, cmd.quantity, allow_negative)?;

        let by = |reason| Provenance {
            reason,
            reference: cmd.reference.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        };
        let source = t.commit_write(out, by(MovementReason::TransferOut));
        let destination = t.commit_write(into, by(MovementReason::TransferIn));
        Ok(TransferOutcome {
            source,
            destination,
        })
    }

    async fn quantity_at(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<i64> {
        Ok(self.read()?.level_quantity(product_id, location_id))
    }

    async fn total_quantity(&self, product_id: ProductId) -> LedgerResult<i64> {
        Ok(self
            .read()?
            .products
            .get(&product_id)
            .map(|p| p.total_quantity)
            .unwrap_or(0))
    }

    async fn list_stock_levels(&self, product_id: ProductId) -> LedgerResult<Vec<StockLevel>> {
        let t = self.read()?;
        let mut levels: Vec<StockLevel> = t
            .levels
            .values()
            .filter(|l| l.product_id == product_id)
            .cloned()
            .collect();
        levels.sort_by_key(|l| l.location_id);
        Ok(levels)
    }

    async fn movement_history(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<StockMovement>> {
        let t = self.read()?;
        Ok(t.movements
            .iter()
            .filter(|m| m.product_id == product_id && m.location_id == location_id)
            .cloned()
            .collect())
    }

    async fn delete_location(&self, location_id: LocationId) -> LedgerResult<Vec<LedgerChange>> {
        let mut t = self.write()?;
        t.location(location_id)?;
        let occurred_at = Utc::now();

        let mut keys: Vec<(ProductId, LocationId)> = t
            .levels
            .keys()
            .filter(|(_, l)| *l == location_id)
            .copied()
            .collect();
        keys.sort();

        let mut changes = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(level) = t.levels.remove(&key) else {
                continue;
            };
            t.movements.push(StockMovement::record(
                level.product_id,
                location_id,
                level.quantity,
                -level.quantity,
                MovementReason::LocationRemoved,
                None,
                None,
                occurred_at,
            ));
            for serial in t.serials.values_mut() {
                if serial.stock_level_id == Some(level.id) {
                    serial.stock_level_id = None;
                    serial.updated_at = occurred_at;
                }
            }
            let (previous_total, new_total) = t.reconcile(level.product_id);
            changes.push(LedgerChange {
                product_id: level.product_id,
                location_id,
                previous_quantity: level.quantity,
                new_quantity: 0,
                previous_total,
                new_total,
            });
        }

        for batch in t.batches.values_mut() {
            if batch.location_id == Some(location_id) && batch.active {
                batch.active = false;
                batch.version += 1;
            }
        }
        t.locations.remove(&location_id);
        Ok(changes)
    }

    async fn create_batch(&self, batch: NewBatch) -> LedgerResult<Batch> {
        batch.validate()?;
        let mut t = self.write()?;
        t.product(batch.product_id)?;
        if let Some(location_id) = batch.location_id {
            t.location(location_id)?;
        }
        if t.batches.contains_key(&batch.batch_id) {
            return Err(LedgerError::validation(format!(
                "batch {} already exists",
                batch.batch_id
            )));
        }
        let batch = batch.into_batch();
        t.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn receive_batch(
        &self,
        batch: NewBatch,
        actor: Option<UserId>,
    ) -> LedgerResult<(Batch, LedgerChange)> {
        batch.validate()?;
        let location_id = batch
            .location_id
            .ok_or_else(|| LedgerError::validation("receiving a batch requires a location"))?;
        let mut t = self.write()?;
        if t.batches.contains_key(&batch.batch_id) {
            return Err(LedgerError::validation(format!(
                "batch {} already exists",
                batch.batch_id
            )));
        }
        let write = t.plan_write(batch.product_id, location_id, batch.initial_quantity, true)?;

        let batch = batch.into_batch();
        t.batches.insert(batch.id, batch.clone());
        let change = t.commit_write(
            write,
            Provenance {
                reason: MovementReason::Receipt,
                reference: Some(batch.batch_number.clone()),
                actor,
                occurred_at: batch.created_at,
            },
        );
        Ok((batch, change))
    }

    async fn get_batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.read()?.batch(batch_id).cloned()
    }

    async fn list_batches(&self, product_id: ProductId) -> LedgerResult<Vec<Batch>> {
        let t = self.read()?;
        let mut batches: Vec<Batch> = t
            .batches
            .values()
            .filter(|b| b.product_id == product_id)
            .cloned()
            .collect();
        sort_fefo(&mut batches);
        Ok(batches)
    }

    async fn has_active_batches(&self, product_id: ProductId) -> LedgerResult<bool> {
        let t = self.read()?;
        Ok(t
            .batches
            .values()
            .any(|b| b.product_id == product_id && b.active))
    }

    async fn allocation_candidates(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<Batch>> {
        let t = self.read()?;
        t.product(product_id)?;
        t.location(location_id)?;
        let mut batches: Vec<Batch> = t
            .batches
            .values()
            .filter(|b| {
                b.product_id == product_id
                    && b.location_id == Some(location_id)
                    && b.is_allocatable()
            })
            .cloned()
            .collect();
        sort_fefo(&mut batches);
        Ok(batches)
    }

    async fn commit_allocation(
        &self,
        plan: &AllocationPlan,
        request: &AllocationRequest,
        allow_negative: bool,
    ) -> LedgerResult<Allocation> {
        check_plan(plan, request)?;
        let mut t = self.write()?;
        let staged = stage_draws(plan, |id| t.batch(id).cloned())?;
        let write = t.plan_write(
            plan.product_id,
            plan.location_id,
            -plan.fulfilled(),
            allow_negative,
        )?;

        t.insert_batches(staged);
        t.history.extend(plan.history_entries(request));
        let ledger = t.commit_write(
            write,
            Provenance {
                reason: request.change_type.movement_reason(),
                reference: request.reference.clone(),
                actor: request.actor,
                occurred_at: request.occurred_at,
            },
        );
        Ok(Allocation {
            lines: plan.lines(),
            fulfilled: plan.fulfilled(),
            ledger,
        })
    }

    async fn adjust_batch(
        &self,
        cmd: AdjustBatch,
        allow_negative: bool,
    ) -> LedgerResult<BatchAdjustment> {
        cmd.validate()?;
        let mut t = self.write()?;
        let mut batch = t.batch(cmd.batch_id)?.clone();
        if !batch.active {
            return Err(LedgerError::validation(format!(
                "batch {} is inactive",
                batch.batch_number
            )));
        }
        let entry = cmd.history_entry(batch.apply_change(cmd.delta)?);
        let write = match batch.location_id {
            Some(location_id) => Some(t.plan_write(
                batch.product_id,
                location_id,
                cmd.delta,
                allow_negative,
            )?),
            None => None,
        };

        t.batches.insert(batch.id, batch.clone());
        t.history.push(entry.clone());
        let ledger = write.map(|w| {
            t.commit_write(
                w,
                Provenance {
                    reason: cmd.change_type.movement_reason(),
                    reference: cmd.reference.clone(),
                    actor: cmd.actor,
                    occurred_at: cmd.occurred_at,
                },
            )
        });
        Ok(BatchAdjustment {
            batch,
            entry,
            ledger,
        })
    }

    async fn commit_batch_transfer(
        &self,
        transfer: &BatchTransfer,
        plan: &AllocationPlan,
        allow_negative: bool,
    ) -> LedgerResult<BatchTransferOutcome> {
        transfer.validate()?;
        let request = transfer.source_request();
        check_plan(plan, &request)?;

        let mut t = self.write()?;
        let staged = stage_draws(plan, |id| t.batch(id).cloned())?;
        let destination_batches: Vec<Batch> = transfer
            .destination_batches(plan)
            .into_iter()
            .map(|b| b.validate().map(|_| b.into_batch()))
            .collect::<LedgerResult<_>>()?;
        let out = t.plan_write(
            transfer.product_id,
            transfer.from_location,
            -plan.fulfilled(),
            allow_negative,
        )?;
        let into = t.plan_write(
            transfer.product_id,
            transfer.to_location,
            plan.fulfilled(),
            allow_negative,
        )?;

        t.insert_batches(staged);
        t.insert_batches(destination_batches.clone());
        t.history.extend(plan.history_entries(&request));
        let by = |reason| Provenance {
            reason,
            reference: transfer.reference.clone(),
            actor: transfer.actor,
            occurred_at: transfer.occurred_at,
        };
        let source = t.commit_write(out, by(MovementReason::TransferOut));
        let destination = t.commit_write(into, by(MovementReason::TransferIn));

        Ok(BatchTransferOutcome {
            lines: plan.lines(),
            destination_batches,
            ledger: TransferOutcome {
                source,
                destination,
            },
        })
    }

    async fn batch_history(&self, batch_id: BatchId) -> LedgerResult<Vec<BatchHistoryEntry>> {
        let t = self.read()?;
        t.batch(batch_id)?;
        Ok(t.history
            .iter()
            .filter(|e| e.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn expiry_report(
        &self,
        today: NaiveDate,
        threshold_days: u32,
    ) -> LedgerResult<Vec<ExpiringBatch>> {
        let t = self.read()?;
        Ok(expiry_report(
            t.batches.values(),
            |p| t.products.get(&p).map(|x| x.name.clone()),
            |l| t.locations.get(&l).map(|x| x.name.clone()),
            today,
            threshold_days,
        ))
    }

    async fn create_serial_numbers(
        &self,
        cmd: CreateSerialNumbers,
    ) -> LedgerResult<Vec<SerialNumber>> {
        let rows = cmd.build()?;
        let mut t = self.write()?;
        t.product(cmd.product_id)?;
        if let Some(batch_id) = cmd.batch_id {
            t.batch(batch_id)?;
        }
        if let Some(level_id) = cmd.stock_level_id {
            if !t.levels.values().any(|l| l.id == level_id) {
                return Err(LedgerError::not_found("stock level", level_id));
            }
        }
        if let Some(taken) = rows.iter().find(|r| {
            t.serials.values().any(|s| {
                s.product_id == r.product_id && s.serial_number == r.serial_number
            })
        }) {
            return Err(LedgerError::DuplicateSerialNumber {
                product_id: taken.product_id,
                serial_number: taken.serial_number.clone(),
            });
        }

        for row in &rows {
            t.serials.insert(row.id, row.clone());
        }
        Ok(rows)
    }

    async fn transition_serial(&self, cmd: ChangeSerialStatus) -> LedgerResult<SerialTransition> {
        let mut t = self.write()?;
        let mut serial = t
            .serials
            .get(&cmd.serial_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("serial number", cmd.serial_id))?;
        if let Some(level_id) = cmd.stock_level_id {
            if !t.levels.values().any(|l| l.id == level_id) {
                return Err(LedgerError::not_found("stock level", level_id));
            }
        }
        let transition = serial.transition(cmd.to, cmd.stock_level_id, cmd.occurred_at)?;
        t.serials.insert(serial.id, serial);
        Ok(transition)
    }

    async fn get_serial(&self, serial_id: SerialNumberId) -> LedgerResult<SerialNumber> {
        self.read()?
            .serials
            .get(&serial_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("serial number", serial_id))
    }

    async fn find_serial(
        &self,
        product_id: ProductId,
        serial_number: &str,
    ) -> LedgerResult<Option<SerialNumber>> {
        let wanted = serial_number.trim();
        Ok(self
            .read()?
            .serials
            .values()
            .find(|s| s.product_id == product_id && s.serial_number == wanted)
            .cloned())
    }

    async fn list_serials(
        &self,
        product_id: ProductId,
        status: Option<SerialStatus>,
    ) -> LedgerResult<Vec<SerialNumber>> {
        let t = self.read()?;
        let mut serials: Vec<SerialNumber> = t
            .serials
            .values()
            .filter(|s| s.product_id == product_id && status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        serials.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        Ok(serials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded() -> (InMemoryInventoryStore, ProductId, LocationId) {
        let store = InMemoryInventoryStore::new();
        let product = store
            .register_product(NewProduct {
                product_id: ProductId::new(),
                sku: "MILK-1L".into(),
                name: "Milk 1L".into(),
                reorder_threshold: 2,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
        let location = store
            .register_location(NewLocation {
                location_id: LocationId::new(),
                name: "Main".into(),
                is_primary: true,
            })
            .await
            .unwrap();
        (store, product.id, location.id)
    }

    fn adjust(product_id: ProductId, location_id: LocationId, delta: i64) -> AdjustQuantity {
        AdjustQuantity {
            product_id,
            location_id,
            delta,
            reason: MovementReason::Adjustment,
            reference: None,
            actor: None,
            occurred_at: Utc::now(),
        }
    }

    fn new_batch(
        product_id: ProductId,
        location_id: LocationId,
        number: &str,
        qty: i64,
        expires_in_days: Option<i64>,
    ) -> NewBatch {
        NewBatch {
            batch_id: BatchId::new(),
            product_id,
            variant_id: None,
            location_id: Some(location_id),
            batch_number: number.into(),
            initial_quantity: qty,
            expiry_date: expires_in_days.map(|d| Utc::now().date_naive() + Duration::days(d)),
            manufacturing_date: None,
            unit_cost: 100,
            supplier_id: None,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unknown_rows_are_not_found() {
        let (store, product_id, _) = seeded().await;
        let err = store
            .adjust_quantity(adjust(product_id, LocationId::new(), 1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { resource: "location", .. }));
        assert!(matches!(
            store.get_batch(BatchId::new()).await,
            Err(LedgerError::NotFound { resource: "batch", .. })
        ));
        assert_eq!(store.total_quantity(ProductId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_primary_location_demotes_the_first() {
        let (store, _, main) = seeded().await;
        let backup = store
            .register_location(NewLocation {
                location_id: LocationId::new(),
                name: "Backroom".into(),
                is_primary: true,
            })
            .await
            .unwrap();
        let primaries: Vec<_> = store
            .list_locations()
            .await
            .unwrap()
            .into_iter()
            .filter(|l| l.is_primary)
            .map(|l| l.id)
            .collect();
        assert_eq!(primaries, vec![backup.id]);
        assert!(!store.get_location(main).await.unwrap().is_primary);
    }

    #[tokio::test]
    async fn duplicate_sku_is_rejected() {
        let (store, _, _) = seeded().await;
        let err = store
            .register_product(NewProduct {
                product_id: ProductId::new(),
                sku: "MILK-1L".into(),
                name: "Other milk".into(),
                reorder_threshold: 0,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn stale_plan_is_a_conflict_and_changes_nothing() {
        let (store, product_id, location_id) = seeded().await;
        store
            .receive_batch(new_batch(product_id, location_id, "A", 10, Some(10)), None)
            .await
            .unwrap();

        let request = AllocationRequest::sale(product_id, location_id, 4, Utc::now());
        let snapshot = store
            .allocation_candidates(product_id, location_id)
            .await
            .unwrap();
        let stale = AllocationPlan::build(&request, &snapshot).unwrap();

        // Someone else drains part of the batch first.
        let fresh = AllocationPlan::build(&request, &snapshot).unwrap();
        store.commit_allocation(&fresh, &request, false).await.unwrap();

        let err = store
            .commit_allocation(&stale, &request, false)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(_)));
        assert_eq!(store.quantity_at(product_id, location_id).await.unwrap(), 6);
        let batch = store.get_batch(stale.draws[0].batch_id).await.unwrap();
        assert_eq!(batch.current_quantity, 6);
        assert_eq!(store.batch_history(batch.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extreme_batch_deltas_fail_without_poisoning_the_store() {
        let (store, product_id, location_id) = seeded().await;
        let (batch, _) = store
            .receive_batch(new_batch(product_id, location_id, "A", 10, None), None)
            .await
            .unwrap();
        for delta in [i64::MAX, i64::MIN] {
            let err = store
                .adjust_batch(
                    AdjustBatch {
                        batch_id: batch.id,
                        delta,
                        change_type: stockledger_inventory::ChangeType::Adjustment,
                        reference: None,
                        actor: None,
                        occurred_at: Utc::now(),
                    },
                    false,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::InvalidQuantity(_)));
        }

        let batch = store.get_batch(batch.id).await.unwrap();
        assert_eq!((batch.current_quantity, batch.version), (10, 1));
        assert!(store.batch_history(batch.id).await.unwrap().is_empty());
        assert_eq!(store.quantity_at(product_id, location_id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn extreme_quantity_deltas_fail_without_poisoning_the_store() {
        let (store, product_id, main) = seeded().await;
        let backroom = store
            .register_location(NewLocation {
                location_id: LocationId::new(),
                name: "Backroom".into(),
                is_primary: false,
            })
            .await
            .unwrap()
            .id;
        store
            .adjust_quantity(adjust(product_id, main, 5), false)
            .await
            .unwrap();

        let err = store
            .adjust_quantity(adjust(product_id, main, i64::MAX), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidQuantity(_)));

        // The level alone fits, the product total does not.
        let err = store
            .adjust_quantity(adjust(product_id, backroom, i64::MAX), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidQuantity(_)));

        let err = store
            .adjust_quantity(adjust(product_id, main, i64::MIN), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientStock { requested: i64::MAX, available: 5, .. }
        ));

        assert_eq!(store.quantity_at(product_id, main).await.unwrap(), 5);
        assert_eq!(store.quantity_at(product_id, backroom).await.unwrap(), 0);
        assert_eq!(store.total_quantity(product_id).await.unwrap(), 5);
        assert_eq!(store.movement_history(product_id, main).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plan_against_another_products_batch_is_rejected() {
        let (store, product_id, location_id) = seeded().await;
        let other = store
            .register_product(NewProduct {
                product_id: ProductId::new(),
                sku: "CREAM".into(),
                name: "Cream".into(),
                reorder_threshold: 0,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap()
            .id;
        store
            .adjust_quantity(adjust(product_id, location_id, 10), false)
            .await
            .unwrap();
        let (foreign, _) = store
            .receive_batch(new_batch(other, location_id, "C", 10, None), None)
            .await
            .unwrap();

        let candidates = store.allocation_candidates(other, location_id).await.unwrap();
        let mut plan = AllocationPlan::build(
            &AllocationRequest::sale(other, location_id, 4, Utc::now()),
            &candidates,
        )
        .unwrap();
        plan.product_id = product_id;

        let request = AllocationRequest::sale(product_id, location_id, 4, Utc::now());

        let err = store.commit_allocation(&plan, &request, false).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(store.get_batch(foreign.id).await.unwrap().current_quantity, 10);
        assert_eq!(store.quantity_at(product_id, location_id).await.unwrap(), 10);
        assert!(store.batch_history(foreign.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_drawing_a_batch_twice_is_rejected() {
        let (store, product_id, location_id) = seeded().await;
        let (batch, _) = store
            .receive_batch(new_batch(product_id, location_id, "A", 10, None), None)
            .await
            .unwrap();
        let candidates = store
            .allocation_candidates(product_id, location_id)
            .await
            .unwrap();
        let mut plan = AllocationPlan::build(
            &AllocationRequest::sale(product_id, location_id, 3, Utc::now()),
            &candidates,
        )
        .unwrap();
        let repeated = plan.draws[0].clone();
        plan.draws.push(repeated);
        plan.requested = 6;

        let request = AllocationRequest::sale(product_id, location_id, 6, Utc::now());
        let err = store.commit_allocation(&plan, &request, false).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(store.get_batch(batch.id).await.unwrap().current_quantity, 10);
        assert_eq!(store.quantity_at(product_id, location_id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn serial_numbers_are_unique_per_product_only() {
        let (store, product_id, _) = seeded().await;
        let other = store
            .register_product(NewProduct {
                product_id: ProductId::new(),
                sku: "PHONE".into(),
                name: "Phone".into(),
                reorder_threshold: 0,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
        let request = |product_id, serials: &[&str]| CreateSerialNumbers {
            product_id,
            serials: serials.iter().map(|s| stockledger_inventory::NewSerial::new(*s)).collect(),
            batch_id: None,
            stock_level_id: None,
            warranty_months: 0,
            received_at: Utc::now(),
        };

        store
            .create_serial_numbers(request(product_id, &["SN-1", "SN-2"]))
            .await
            .unwrap();
        store
            .create_serial_numbers(request(other.id, &["SN-1"]))
            .await
            .unwrap();

        let err = store
            .create_serial_numbers(request(product_id, &["SN-3", "SN-2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateSerialNumber { ref serial_number, .. } if serial_number == "SN-2"));
        // All-or-nothing: SN-3 was not stored either.
        assert!(store.find_serial(product_id, "SN-3").await.unwrap().is_none());
        assert_eq!(store.list_serials(product_id, None).await.unwrap().len(), 2);
    }
}

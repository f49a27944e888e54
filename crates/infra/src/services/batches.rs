use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use stockledger_core::{BatchId, LedgerError, LedgerResult, LocationId, ProductId, UserId};
use stockledger_inventory::{
    AdjustBatch, Allocation, AllocationPlan, AllocationRequest, Batch, BatchAdjustment,
    BatchHistoryEntry, BatchTransfer, BatchTransferOutcome, ChangeType, LedgerChange, NewBatch,
    cost_of_goods_sold,
};

use crate::config::LedgerConfig;
use crate::services::retry_conflicts;
use crate::store::InventoryStore;

/// Batch lots and FEFO allocation against them.
#[derive(Debug, Clone)]
pub struct BatchLedger<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> BatchLedger<S> {
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

impl<S: InventoryStore> BatchLedger<S> {
    /// Record a batch without touching location quantities.
    ///
    /// Allocation debits the location ledger as well as the batches, so stock
    /// recorded here must also be credited with `adjust_quantity` (or use
    /// [`BatchLedger::receive_batch`], which does both). Until then an
    /// allocation fails with `InsufficientStock` reporting the ledger quantity.
    #[instrument(skip_all, fields(product_id = %batch.product_id, batch_number = %batch.batch_number), err)]
    pub async fn create_batch(&self, batch: NewBatch) -> LedgerResult<Batch> {
        let batch = self.store.create_batch(batch).await?;
        info!(batch_id = %batch.id, quantity = batch.initial_quantity, "batch created");
        Ok(batch)
    }

    /// Record a batch and credit its location in the ledger.
    #[instrument(skip_all, fields(product_id = %batch.product_id, batch_number = %batch.batch_number), err)]
    pub async fn receive_batch(
        &self,
        batch: NewBatch,
        actor: Option<UserId>,
    ) -> LedgerResult<(Batch, LedgerChange)> {
        let (batch, change) = self.store.receive_batch(batch, actor).await?;
        info!(
            batch_id = %batch.id,
            quantity = batch.initial_quantity,
            location_quantity = change.new_quantity,
            "batch received"
        );
        Ok((batch, change))
    }

    /// Whether the product has any active batch.
    pub async fn tracks_batches(&self, product_id: ProductId) -> LedgerResult<bool> {
        self.store.has_active_batches(product_id).await
    }

    pub async fn get_batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.store.get_batch(batch_id).await
    }

    pub async fn list_batches(&self, product_id: ProductId) -> LedgerResult<Vec<Batch>> {
        self.store.list_batches(product_id).await
    }

    pub async fn batch_history(&self, batch_id: BatchId) -> LedgerResult<Vec<BatchHistoryEntry>> {
        self.store.batch_history(batch_id).await
    }

    /// Sale quantity drawn from a batch times its unit cost.
    pub async fn cost_of_goods_sold(&self, batch_id: BatchId) -> LedgerResult<i64> {
        let batch = self.store.get_batch(batch_id).await?;
        let history = self.store.batch_history(batch_id).await?;
        Ok(cost_of_goods_sold(batch.unit_cost, &history))
    }

    /// Deplete batches earliest-expiry-first until the request is met.
    ///
    /// All-or-nothing: when the active batches at the location cannot cover
    /// the request nothing is written. A commit that loses a race against
    /// another writer is re-planned per the configured retry policy.
    #[instrument(
        skip_all,
        fields(
            product_id = %request.product_id,
            location_id = %request.location_id,
            quantity = request.quantity_needed,
            change_type = %request.change_type
        ),
        err
    )]
    pub async fn allocate_stock_from_batches(
        &self,
        request: AllocationRequest,
    ) -> LedgerResult<Allocation> {
        request.validate()?;
        let request = &request;
        let allocation = retry_conflicts(
            &self.config.allocation_retry,
            "allocate_stock_from_batches",
            move || self.allocate_once(request),
        )
        .await?;
        info!(
            lines = allocation.lines.len(),
            fulfilled = allocation.fulfilled,
            cost = allocation.total_cost(),
            "batches allocated"
        );
        Ok(allocation)
    }

    async fn allocate_once(&self, request: &AllocationRequest) -> LedgerResult<Allocation> {
        let plan = self.plan(request).await?;
        match self
            .store
            .commit_allocation(&plan, request, self.config.allow_negative_stock)
            .await
        {
            Err(err @ LedgerError::InsufficientStock { .. }) => {
                warn!(
                    error = %err,
                    batch_stock = plan.fulfilled(),
                    "batches cover the request but the location ledger does not"
                );
                Err(err)
            }
            result => result,
        }
    }

    async fn plan(&self, request: &AllocationRequest) -> LedgerResult<AllocationPlan> {
        let candidates = self
            .store
            .allocation_candidates(request.product_id, request.location_id)
            .await?;
        match AllocationPlan::build(request, &candidates) {
            Ok(plan) => {
                let draws: Vec<(&str, i64)> = plan
                    .draws
                    .iter()
                    .map(|d| (d.batch_number.as_str(), d.quantity))
                    .collect();
                debug!(candidates = candidates.len(), ?draws, "allocation planned");
                Ok(plan)
            }
            Err(err) => {
                warn!(error = %err, "allocation rejected");
                Err(err)
            }
        }
    }

    /// Bounded correction to a single batch.
    #[instrument(skip_all, fields(batch_id = %batch_id, delta = delta, change_type = %change_type), err)]
    pub async fn adjust_batch(
        &self,
        batch_id: BatchId,
        delta: i64,
        change_type: ChangeType,
        reference: Option<String>,
        actor: Option<UserId>,
    ) -> LedgerResult<BatchAdjustment> {
        let cmd = AdjustBatch {
            batch_id,
            delta,
            change_type,
            reference,
            actor,
            occurred_at: Utc::now(),
        };
        cmd.validate()?;
        let adjustment = self
            .store
            .adjust_batch(cmd, self.config.allow_negative_stock)
            .await?;
        info!(
            previous = adjustment.entry.previous_quantity,
            new = adjustment.batch.current_quantity,
            "batch adjusted"
        );
        Ok(adjustment)
    }

    /// Move stock between locations batch by batch, earliest expiry first.
    ///
    /// Each consumed source batch yields one destination batch carrying the
    /// same number, dates, cost and supplier.
    #[instrument(
        skip_all,
        fields(product_id = %product_id, from = %from, to = %to, quantity = quantity),
        err
    )]
    pub async fn transfer_batches(
        &self,
        product_id: ProductId,
        from: LocationId,
        to: LocationId,
        quantity: i64,
        reference: Option<String>,
        actor: Option<UserId>,
    ) -> LedgerResult<BatchTransferOutcome> {
        let transfer = BatchTransfer {
            product_id,
            from_location: from,
            to_location: to,
            quantity,
            reference,
            actor,
            occurred_at: Utc::now(),
        };
        transfer.validate()?;
        self.store.get_location(to).await?;

        let transfer = &transfer;
        let outcome = retry_conflicts(
            &self.config.allocation_retry,
            "transfer_batches",
            move || self.transfer_once(transfer),
        )
        .await?;
        info!(
            batches = outcome.destination_batches.len(),
            source_left = outcome.ledger.source.new_quantity,
            "batches transferred"
        );
        Ok(outcome)
    }

    async fn transfer_once(&self, transfer: &BatchTransfer) -> LedgerResult<BatchTransferOutcome> {
        let plan = self.plan(&transfer.source_request()).await?;
        self.store
            .commit_batch_transfer(transfer, &plan, self.config.allow_negative_stock)
            .await
    }
}

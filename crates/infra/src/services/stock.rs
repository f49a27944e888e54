use chrono::Utc;
use tracing::{info, instrument, warn};

use stockledger_core::{LedgerError, LedgerResult, LocationId, ProductId, UserId};
use stockledger_inventory::{
    AdjustQuantity, LedgerChange, Location, LowStockItem, MovementReason, NewLocation, NewProduct,
    Product, StockLevel, StockMovement, TransferOutcome, TransferQuantity,
};

use crate::config::LedgerConfig;
use crate::store::InventoryStore;

/// Per-location quantities and the product totals derived from them.
///
/// Every quantity change goes through the store's ledger write, which
/// reconciles the cached product total and appends a movement in the same
/// transaction.
#[derive(Debug, Clone)]
pub struct StockLedger<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> StockLedger<S> {
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

impl<S: InventoryStore> StockLedger<S> {
    pub async fn register_product(&self, product: NewProduct) -> LedgerResult<Product> {
        let product = self.store.register_product(product).await?;
        info!(product_id = %product.id, sku = %product.sku, "product registered");
        Ok(product)
    }

    pub async fn register_location(&self, location: NewLocation) -> LedgerResult<Location> {
        let location = self.store.register_location(location).await?;
        info!(location_id = %location.id, primary = location.is_primary, "location registered");
        Ok(location)
    }

    pub async fn get_product(&self, product_id: ProductId) -> LedgerResult<Product> {
        self.store.get_product(product_id).await
    }

    pub async fn get_location(&self, location_id: LocationId) -> LedgerResult<Location> {
        self.store.get_location(location_id).await
    }

    pub async fn list_locations(&self) -> LedgerResult<Vec<Location>> {
        self.store.list_locations().await
    }

    /// Apply a signed delta to one (product, location) pair.
    ///
    /// Fails with `InsufficientStock` when the result would be negative,
    /// unless negative stock is enabled.
    #[instrument(
        skip_all,
        fields(product_id = %product_id, location_id = %location_id, delta = delta, reason = %reason),
        err
    )]
    pub async fn adjust_quantity(
        &self,
        product_id: ProductId,
        location_id: LocationId,
        delta: i64,
        reason: MovementReason,
        reference: Option<String>,
        actor: Option<UserId>,
    ) -> LedgerResult<LedgerChange> {
        if delta == 0 {
            return Err(LedgerError::invalid_quantity(
                "quantity change must be non-zero",
            ));
        }
        let cmd = AdjustQuantity {
            product_id,
            location_id,
            delta,
            reason,
            reference,
            actor,
            occurred_at: Utc::now(),
        };
        match self
            .store
            .adjust_quantity(cmd, self.config.allow_negative_stock)
            .await
        {
            Ok(change) => {
                info!(
                    previous = change.previous_quantity,
                    new = change.new_quantity,
                    total = change.new_total,
                    "stock adjusted"
                );
                Ok(change)
            }
            Err(err @ LedgerError::InsufficientStock { .. }) => {
                warn!(error = %err, "adjustment rejected");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Move quantity between two locations atomically.
    #[instrument(
        skip_all,
        fields(product_id = %product_id, from = %from, to = %to, quantity = quantity),
        err
    )]
    pub async fn transfer_quantity(
        &self,
        product_id: ProductId,
        from: LocationId,
        to: LocationId,
        quantity: i64,
        reference: Option<String>,
        actor: Option<UserId>,
    ) -> LedgerResult<TransferOutcome> {
        let cmd = TransferQuantity {
            product_id,
            from_location: from,
            to_location: to,
            quantity,
            reference,
            actor,
            occurred_at: Utc::now(),
        };
        cmd.validate()?;
        let outcome = self
            .store
            .transfer_quantity(cmd, self.config.allow_negative_stock)
            .await?;
        info!(
            source_left = outcome.source.new_quantity,
            destination_now = outcome.destination.new_quantity,
            "stock transferred"
        );
        Ok(outcome)
    }

    /// Quantity at one location; zero when no row exists.
    pub async fn get_quantity_at_location(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<i64> {
        self.store.quantity_at(product_id, location_id).await
    }

    /// Cached product total; zero for unknown products.
    pub async fn get_total_quantity(&self, product_id: ProductId) -> LedgerResult<i64> {
        self.store.total_quantity(product_id).await
    }

    pub async fn list_stock_levels(&self, product_id: ProductId) -> LedgerResult<Vec<StockLevel>> {
        self.store.list_stock_levels(product_id).await
    }

    pub async fn low_stock_products(&self) -> LedgerResult<Vec<LowStockItem>> {
        self.store.low_stock_products().await
    }

    pub async fn movement_history(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<StockMovement>> {
        self.store.movement_history(product_id, location_id).await
    }

    /// Remove a location, zeroing its stock and deactivating its batches.
    #[instrument(skip_all, fields(location_id = %location_id), err)]
    pub async fn delete_location(&self, location_id: LocationId) -> LedgerResult<Vec<LedgerChange>> {
        let changes = self.store.delete_location(location_id).await?;
        info!(levels = changes.len(), "location deleted");
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use proptest::prelude::*;
    use stockledger_inventory::{reconciled_total, replay_movements};

    use crate::services::fixtures::{self, Store};
    use crate::store::InMemoryInventoryStore;

    fn ledger(config: LedgerConfig) -> StockLedger<Store> {
        StockLedger::new(Arc::new(InMemoryInventoryStore::new()), config)
    }

    #[tokio::test]
    async fn total_follows_every_location() {
        let ledger = ledger(LedgerConfig::default());
        let p = fixtures::product(ledger.store(), "BOLT", 0).await;
        let a = fixtures::location(ledger.store(), "A").await;
        let b = fixtures::location(ledger.store(), "B").await;

        let change = ledger
            .adjust_quantity(p, a, 10, MovementReason::Receipt, None, None)
            .await
            .unwrap();
        assert_eq!((change.previous_total, change.new_total), (0, 10));
        ledger
            .adjust_quantity(p, b, 4, MovementReason::Receipt, None, None)
            .await
            .unwrap();
        let change = ledger
            .adjust_quantity(p, a, -3, MovementReason::Sale, Some("SO-1".into()), None)
            .await
            .unwrap();
        assert_eq!(change.previous_quantity, 10);
        assert_eq!(change.new_quantity, 7);
        assert_eq!(change.new_total, 11);

        assert_eq!(ledger.get_total_quantity(p).await.unwrap(), 11);
        assert_eq!(ledger.get_quantity_at_location(p, b).await.unwrap(), 4);
        let levels = ledger.list_stock_levels(p).await.unwrap();
        assert_eq!(reconciled_total(&levels), 11);
    }

    #[tokio::test]
    async fn zero_delta_is_invalid() {
        let ledger = ledger(LedgerConfig::default());
        let p = fixtures::product(ledger.store(), "BOLT", 0).await;
        let a = fixtures::location(ledger.store(), "A").await;
        let err = ledger
            .adjust_quantity(p, a, 0, MovementReason::Adjustment, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidQuantity(_)));
    }

    #[tokio::test]
    async fn negative_stock_follows_configuration() {
        let strict = ledger(LedgerConfig::default());
        let p = fixtures::product(strict.store(), "BOLT", 0).await;
        let a = fixtures::location(strict.store(), "A").await;
        let err = strict
            .adjust_quantity(p, a, -1, MovementReason::Sale, None, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "not enough stock available for product {p} at location {a} (requested 1, available 0)"
            )
        );
        assert!(strict.movement_history(p, a).await.unwrap().is_empty());

        let lenient = ledger(LedgerConfig::default().with_negative_stock(true));
        let p = fixtures::product(lenient.store(), "BOLT", 0).await;
        let a = fixtures::location(lenient.store(), "A").await;
        let change = lenient
            .adjust_quantity(p, a, -2, MovementReason::Sale, None, None)
            .await
            .unwrap();
        assert_eq!(change.new_total, -2);
    }

    #[tokio::test]
    async fn transfer_moves_stock_or_nothing() {
        let ledger = ledger(LedgerConfig::default());
        let p = fixtures::product(ledger.store(), "BOLT", 0).await;
        let a = fixtures::location(ledger.store(), "A").await;
        let b = fixtures::location(ledger.store(), "B").await;
        ledger
            .adjust_quantity(p, a, 5, MovementReason::Receipt, None, None)
            .await
            .unwrap();

        let outcome = ledger
            .transfer_quantity(p, a, b, 3, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.source.new_quantity, 2);
        assert_eq!(outcome.destination.new_quantity, 3);
        assert_eq!(outcome.destination.new_total, 5);

        let err = ledger
            .transfer_quantity(p, a, b, 9, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(ledger.get_quantity_at_location(p, a).await.unwrap(), 2);
        assert_eq!(ledger.get_quantity_at_location(p, b).await.unwrap(), 3);

        assert!(matches!(
            ledger.transfer_quantity(p, a, a, 1, None, None).await,
            Err(LedgerError::InvalidQuantity(_))
        ));
    }

    #[tokio::test]
    async fn low_stock_uses_the_cached_total() {
        let ledger = ledger(LedgerConfig::default());
        let low = fixtures::product(ledger.store(), "LOW", 5).await;
        let fine = fixtures::product(ledger.store(), "FINE", 5).await;
        let a = fixtures::location(ledger.store(), "A").await;
        ledger
            .adjust_quantity(low, a, 5, MovementReason::Receipt, None, None)
            .await
            .unwrap();
        ledger
            .adjust_quantity(fine, a, 6, MovementReason::Receipt, None, None)
            .await
            .unwrap();

        let items = ledger.low_stock_products().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_id, low);
    }

    #[tokio::test]
    async fn deleting_a_location_reconciles_totals() {
        let ledger = ledger(LedgerConfig::default());
        let p = fixtures::product(ledger.store(), "BOLT", 0).await;
        let q = fixtures::product(ledger.store(), "NUT", 0).await;
        let a = fixtures::location(ledger.store(), "A").await;
        let b = fixtures::location(ledger.store(), "B").await;
        for (product, location, qty) in [(p, a, 4), (p, b, 6), (q, b, 2)] {
            ledger
                .adjust_quantity(product, location, qty, MovementReason::Receipt, None, None)
                .await
                .unwrap();
        }

        let changes = ledger.delete_location(b).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(ledger.get_total_quantity(p).await.unwrap(), 4);
        assert_eq!(ledger.get_total_quantity(q).await.unwrap(), 0);
        assert!(matches!(
            ledger.get_location(b).await,
            Err(LedgerError::NotFound { .. })
        ));

        let removed = ledger.movement_history(p, b).await.unwrap();
        assert_eq!(
            removed.last().map(|m| m.reason),
            Some(MovementReason::LocationRemoved)
        );
        assert_eq!(replay_movements(&removed), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn total_equals_sum_and_movements_replay(
            deltas in prop::collection::vec((0usize..3, -20i64..20), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = ledger(LedgerConfig::default());
                let p = fixtures::product(ledger.store(), "BOLT", 0).await;
                let mut locations = Vec::new();
                for name in ["A", "B", "C"] {
                    locations.push(fixtures::location(ledger.store(), name).await);
                }

                for (idx, delta) in deltas {
                    // Rejections (zero, would go negative) must leave no trace.
                    let _ = ledger
                        .adjust_quantity(p, locations[idx], delta, MovementReason::Adjustment, None, None)
                        .await;

                    let levels = ledger.list_stock_levels(p).await.unwrap();
                    prop_assert!(levels.iter().all(|l| l.quantity >= 0));
                    prop_assert_eq!(ledger.get_total_quantity(p).await.unwrap(), reconciled_total(&levels));
                }

                for location in locations {
                    let movements = ledger.movement_history(p, location).await.unwrap();
                    prop_assert!(movements.iter().all(StockMovement::is_consistent));
                    prop_assert_eq!(
                        replay_movements(&movements),
                        ledger.get_quantity_at_location(p, location).await.unwrap()
                    );
                }
                Ok(())
            })?;
        }
    }
}

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use stockledger_core::{BatchId, LedgerError, LedgerResult, ProductId, SerialNumberId, StockLevelId};
use stockledger_inventory::{
    ChangeSerialStatus, CreateSerialNumbers, NewSerial, SerialNumber, SerialStatus,
    SerialTransition,
};

use crate::store::InventoryStore;

/// Per-unit identity and the status lifecycle of serialized products.
#[derive(Debug, Clone)]
pub struct SerialRegistry<S> {
    store: S,
}

impl<S> SerialRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: InventoryStore> SerialRegistry<S> {
    /// Register received units. A duplicate anywhere in the request, or
    /// against a stored serial of the same product, rejects the whole call.
    #[instrument(skip_all, fields(product_id = %product_id, count = serials.len()), err)]
    pub async fn create_serial_numbers(
        &self,
        product_id: ProductId,
        serials: Vec<NewSerial>,
        batch_id: Option<BatchId>,
        stock_level_id: Option<StockLevelId>,
        warranty_months: u32,
        received_at: DateTime<Utc>,
    ) -> LedgerResult<Vec<SerialNumber>> {
        let cmd = CreateSerialNumbers {
            product_id,
            serials,
            batch_id,
            stock_level_id,
            warranty_months,
            received_at,
        };
        match self.store.create_serial_numbers(cmd).await {
            Ok(created) => {
                info!(created = created.len(), "serial numbers registered");
                Ok(created)
            }
            Err(err @ LedgerError::DuplicateSerialNumber { .. }) => {
                warn!(error = %err, "serial registration rejected");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip_all, fields(serial_id = %serial_id, to = %to), err)]
    pub async fn transition_serial(
        &self,
        serial_id: SerialNumberId,
        to: SerialStatus,
        stock_level_id: Option<StockLevelId>,
        at: DateTime<Utc>,
    ) -> LedgerResult<SerialTransition> {
        let transition = self
            .store
            .transition_serial(ChangeSerialStatus {
                serial_id,
                to,
                stock_level_id,
                occurred_at: at,
            })
            .await?;
        info!(from = %transition.previous, "serial status changed");
        Ok(transition)
    }

    pub async fn get_serial(&self, serial_id: SerialNumberId) -> LedgerResult<SerialNumber> {
        self.store.get_serial(serial_id).await
    }

    pub async fn find_serial(
        &self,
        product_id: ProductId,
        serial_number: &str,
    ) -> LedgerResult<Option<SerialNumber>> {
        self.store.find_serial(product_id, serial_number).await
    }

    pub async fn list_serials(
        &self,
        product_id: ProductId,
        status: Option<SerialStatus>,
    ) -> LedgerResult<Vec<SerialNumber>> {
        self.store.list_serials(product_id, status).await
    }
}

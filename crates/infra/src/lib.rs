//! Infrastructure layer: storage, configuration and the ledger services.

pub mod config;
pub mod services;
pub mod store;

pub use config::{BackoffStrategy, LedgerConfig, RetryPolicy};
pub use services::{BatchLedger, ExpiryAlerts, SerialRegistry, StockLedger};
pub use store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore};

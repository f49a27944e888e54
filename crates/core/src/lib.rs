//! `stockledger-core`: shared building blocks for the stock ledger.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error taxonomy, and optimistic concurrency expectations.

pub mod error;
pub mod id;
pub mod version;

pub use error::{LedgerError, LedgerResult};
pub use id::{
    BatchId, HistoryEntryId, LocationId, MovementId, ProductId, SerialNumberId, StockLevelId,
    SupplierId, UserId, VariantId,
};
pub use version::ExpectedVersion;

//! Stock ledger domain rules.
//!
//! Pure, deterministic logic for the location ledger, batch allocation,
//! serial lifecycle and expiry classification (no IO, no storage). The infra
//! crate persists what these types compute.

pub mod allocation;
pub mod batch;
pub mod catalog;
pub mod expiry;
pub mod history;
pub mod ledger;
pub mod serial;

pub use allocation::{
    Allocation, AllocationLine, AllocationPlan, AllocationRequest, BatchTransfer,
    BatchTransferOutcome, PlannedDraw,
};
pub use batch::{
    AdjustBatch, Batch, BatchAdjustment, ExpiryKey, FefoKey, NewBatch, fefo_cmp, sort_fefo,
};
pub use catalog::{
    Location, LowStockItem, NewLocation, NewProduct, Product, StockLevel, reconciled_total,
};
pub use expiry::{
    DEFAULT_EXPIRY_THRESHOLD_DAYS, ExpiringBatch, ExpiryAlert, alert_worthy, expiry_report,
};
pub use history::{BatchHistoryEntry, ChangeType, cost_of_goods_sold, replay_batch};
pub use ledger::{
    AdjustQuantity, LedgerChange, MovementReason, StockMovement, TransferOutcome,
    TransferQuantity, apply_delta, check_total, replay_movements,
};
pub use serial::{
    ChangeSerialStatus, CreateSerialNumbers, NewSerial, SerialNumber, SerialStatus,
    SerialTransition,
};

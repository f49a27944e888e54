//! Ledger error model.

use thiserror::Error;

use crate::id::{LocationId, ProductId};

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-level error.
///
/// Every operation either succeeds completely or fails with one of these kinds
/// and leaves no partial trace. Callers treat any failure as "the requested
/// business operation did not happen".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A quantity was zero or negative where a positive amount is required.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Input other than a quantity was malformed (e.g. blank name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A serial string already exists for the product.
    #[error("serial number '{serial_number}' already exists for product {product_id}")]
    DuplicateSerialNumber {
        product_id: ProductId,
        serial_number: String,
    },

    /// Not enough stock to satisfy the whole request.
    #[error(
        "not enough stock available for product {product_id} at location {location_id} (requested {requested}, available {available})"
    )]
    InsufficientStock {
        product_id: ProductId,
        location_id: LocationId,
        requested: i64,
        available: i64,
    },

    /// Unknown product / location / batch / serial.
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Illegal serial status change.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Row contention could not be resolved within the retry budget.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Infrastructure failure (database, lock poisoning).
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn invalid_quantity(msg: impl Into<String>) -> Self {
        Self::InvalidQuantity(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn insufficient_stock(
        product_id: ProductId,
        location_id: LocationId,
        requested: i64,
        available: i64,
    ) -> Self {
        Self::InsufficientStock {
            product_id,
            location_id,
            requested,
            available,
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}

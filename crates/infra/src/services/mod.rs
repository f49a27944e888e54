//! Ledger services: the mutation entry points callers use.
//!
//! Services are thin orchestration over an [`InventoryStore`]: they plan
//! against a snapshot using the pure rules in `stockledger-inventory`, hand
//! the plan to the store for an atomic commit, and re-plan when the commit
//! reports a conflict. Configuration decides the negative-stock policy, the
//! expiry threshold and the retry budget.
//!
//! ```text
//! request
//!   ↓
//! 1. snapshot candidates (store read)
//!   ↓
//! 2. plan (pure, FEFO)          → InsufficientStock: nothing written
//!   ↓
//! 3. commit (one transaction)   → ConcurrencyConflict: back off, go to 1
//! ```
//!
//! [`InventoryStore`]: crate::store::InventoryStore

mod batches;
mod expiry;
mod serials;
mod stock;

pub use batches::BatchLedger;
pub use expiry::ExpiryAlerts;
pub use serials::SerialRegistry;
pub use stock::StockLedger;

use std::future::Future;

use tracing::warn;

use stockledger_core::LedgerResult;

use crate::config::RetryPolicy;

/// Run `attempt_once` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
pub(crate) async fn retry_conflicts<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut attempt_once: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match attempt_once().await {
            Err(err) if err.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "conflict, re-planning"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_retryable() => {
                warn!(operation, attempt, error = %err, "giving up after conflicts");
                return Err(err);
            }
            other => return other,
        }
    }
}

//! Expiry alert projection over the batch ledger (read-only).

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use stockledger_core::{BatchId, LocationId, ProductId};

use crate::batch::Batch;

/// Default "expiring soon" window in days.
pub const DEFAULT_EXPIRY_THRESHOLD_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryAlert {
    Expired,
    ExpiringSoon,
    Ok,
}

impl ExpiryAlert {
    /// Classify an expiry date against `today` and a single threshold.
    ///
    /// Expired: strictly before today. Expiring soon: today up to and including
    /// `today + threshold_days`.
    pub fn classify(expiry: NaiveDate, today: NaiveDate, threshold_days: u32) -> Self {
        if expiry < today {
            return ExpiryAlert::Expired;
        }
        let horizon = today
            .checked_add_days(Days::new(u64::from(threshold_days)))
            .unwrap_or(NaiveDate::MAX);
        if expiry <= horizon {
            ExpiryAlert::ExpiringSoon
        } else {
            ExpiryAlert::Ok
        }
    }

    pub fn is_alert(&self) -> bool {
        !matches!(self, ExpiryAlert::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryAlert::Expired => "expired",
            ExpiryAlert::ExpiringSoon => "expiring_soon",
            ExpiryAlert::Ok => "ok",
        }
    }
}

/// One row of the expiry view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringBatch {
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub product_name: String,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub current_quantity: i64,
    pub unit_cost: i64,
    pub location_id: Option<LocationId>,
    pub location_name: Option<String>,
    pub alert_type: ExpiryAlert,
    /// Negative once expired.
    pub days_until_expiry: i64,
}

/// Classify every active, dated batch that still holds stock, ordered by
/// expiry date then batch id.
pub fn expiry_report<'a>(
    batches: impl IntoIterator<Item = &'a Batch>,
    product_name: impl Fn(ProductId) -> Option<String>,
    location_name: impl Fn(LocationId) -> Option<String>,
    today: NaiveDate,
    threshold_days: u32,
) -> Vec<ExpiringBatch> {
    let mut rows: Vec<ExpiringBatch> = batches
        .into_iter()
        .filter(|b| b.is_allocatable())
        .filter_map(|b| {
            let expiry = b.expiry_date?;
            Some(ExpiringBatch {
                batch_id: b.id,
                product_id: b.product_id,
                product_name: product_name(b.product_id).unwrap_or_default(),
                batch_number: b.batch_number.clone(),
                expiry_date: expiry,
                current_quantity: b.current_quantity,
                unit_cost: b.unit_cost,
                location_id: b.location_id,
                location_name: b.location_id.and_then(&location_name),
                alert_type: ExpiryAlert::classify(expiry, today, threshold_days),
                days_until_expiry: (expiry - today).num_days(),
            })
        })
        .collect();
    rows.sort_by_key(|r| (r.expiry_date, r.batch_id));
    rows
}

/// Keep only expired and expiring-soon rows.
pub fn alert_worthy(rows: Vec<ExpiringBatch>) -> Vec<ExpiringBatch> {
    rows.into_iter().filter(|r| r.alert_type.is_alert()).collect()
}

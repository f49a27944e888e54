use chrono::{NaiveDate, Utc};
use tracing::{info, instrument};

use stockledger_core::LedgerResult;
use stockledger_inventory::{ExpiringBatch, alert_worthy};

use crate::config::LedgerConfig;
use crate::store::InventoryStore;

/// Read-only expiry projection over active, dated batches with stock.
#[derive(Debug, Clone)]
pub struct ExpiryAlerts<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> ExpiryAlerts<S> {
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: InventoryStore> ExpiryAlerts<S> {
    /// Expired and expiring-soon batches as of today.
    ///
    /// `None` uses the configured threshold.
    pub async fn get_expiring_batches(
        &self,
        threshold_days: Option<u32>,
    ) -> LedgerResult<Vec<ExpiringBatch>> {
        self.expiring_batches_as_of(Utc::now().date_naive(), threshold_days)
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn expiring_batches_as_of(
        &self,
        today: NaiveDate,
        threshold_days: Option<u32>,
    ) -> LedgerResult<Vec<ExpiringBatch>> {
        let threshold = threshold_days.unwrap_or(self.config.expiry_threshold_days);
        let rows = alert_worthy(self.store.expiry_report(today, threshold).await?);
        info!(alerts = rows.len(), threshold, "expiry alerts computed");
        Ok(rows)
    }

    /// Every dated batch with stock, `ok` rows included.
    pub async fn batch_expiry_report(
        &self,
        today: NaiveDate,
        threshold_days: Option<u32>,
    ) -> LedgerResult<Vec<ExpiringBatch>> {
        let threshold = threshold_days.unwrap_or(self.config.expiry_threshold_days);
        self.store.expiry_report(today, threshold).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use stockledger_inventory::ExpiryAlert;

    use crate::services::fixtures::{self, Store, date};
    use crate::store::InMemoryInventoryStore;

    async fn seeded(config: LedgerConfig) -> (ExpiryAlerts<Store>, NaiveDate) {
        let store: Store = Arc::new(InMemoryInventoryStore::new());
        let today = date(2024, 6, 1);
        let p = fixtures::product(&store, "CHEESE", 0).await;
        let l = fixtures::location(&store, "Cold room").await;
        for (number, days) in [("D45", 45), ("D5", 5), ("D20", 20), ("PAST", -2)] {
            store
                .receive_batch(
                    fixtures::batch(p, l, number, 10, Some(today + Duration::days(days))),
                    None,
                )
                .await
                .unwrap();
        }
        store
            .receive_batch(fixtures::batch(p, l, "NODATE", 10, None), None)
            .await
            .unwrap();
        (ExpiryAlerts::new(store, config), today)
    }

    #[tokio::test]
    async fn thirty_day_threshold_splits_alerts_from_ok() {
        let (alerts, today) = seeded(LedgerConfig::default()).await;

        let rows = alerts.expiring_batches_as_of(today, Some(30)).await.unwrap();
        let got: Vec<_> = rows
            .iter()
            .map(|r| (r.batch_number.as_str(), r.alert_type, r.days_until_expiry))
            .collect();
        assert_eq!(
            got,
            vec![
                ("PAST", ExpiryAlert::Expired, -2),
                ("D5", ExpiryAlert::ExpiringSoon, 5),
                ("D20", ExpiryAlert::ExpiringSoon, 20),
            ]
        );
        assert!(rows.iter().all(|r| r.product_name == "Product CHEESE"));
        assert!(rows
            .iter()
            .all(|r| r.location_name.as_deref() == Some("Cold room")));
    }

    #[tokio::test]
    async fn report_includes_ok_rows_and_skips_undated() {
        let (alerts, today) = seeded(LedgerConfig::default()).await;
        let report = alerts.batch_expiry_report(today, None).await.unwrap();
        assert_eq!(report.len(), 4);
        let last = report.last().unwrap();
        assert_eq!(last.batch_number, "D45");
        assert_eq!(last.alert_type, ExpiryAlert::Ok);
    }

    #[tokio::test]
    async fn configured_threshold_is_the_default() {
        let (alerts, today) =
            seeded(LedgerConfig::default().with_expiry_threshold_days(7)).await;
        let rows = alerts.expiring_batches_as_of(today, None).await.unwrap();
        let numbers: Vec<_> = rows.iter().map(|r| r.batch_number.as_str()).collect();
        assert_eq!(numbers, vec!["PAST", "D5"]);
    }
}

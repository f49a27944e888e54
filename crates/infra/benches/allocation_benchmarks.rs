use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use stockledger_core::{BatchId, LocationId, ProductId};
use stockledger_infra::{BatchLedger, InMemoryInventoryStore, InventoryStore, LedgerConfig};
use stockledger_inventory::{AllocationPlan, AllocationRequest, Batch, NewBatch, NewLocation, NewProduct};

fn lots(product_id: ProductId, location_id: LocationId, count: usize) -> Vec<NewBatch> {
    let base = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap_or_default();
    (0..count)
        .map(|i| NewBatch {
            batch_id: BatchId::new(),
            product_id,
            variant_id: None,
            location_id: Some(location_id),
            batch_number: format!("LOT-{i}"),
            initial_quantity: 10,
            // Every fifth lot has no expiry to exercise the sentinel.
            expiry_date: (i % 5 != 0).then(|| base + Duration::days((count - i) as i64)),
            manufacturing_date: None,
            unit_cost: 100,
            supplier_id: None,
            received_at: Utc::now(),
        })
        .collect()
}

fn bench_plan_building(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_plan_build");
    let product_id = ProductId::new();
    let location_id = LocationId::new();

    for batch_count in [10usize, 100, 1000].iter() {
        let candidates: Vec<Batch> = lots(product_id, location_id, *batch_count)
            .into_iter()
            .map(NewBatch::into_batch)
            .collect();
        // Half of the available stock, so the walk crosses many batches.
        let request =
            AllocationRequest::sale(product_id, location_id, (*batch_count as i64) * 5, Utc::now());

        group.throughput(Throughput::Elements(*batch_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_count),
            &candidates,
            |b, candidates| {
                b.iter(|| AllocationPlan::build(black_box(&request), black_box(candidates)));
            },
        );
    }
    group.finish();
}

fn bench_in_memory_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_allocation");
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");

    group.bench_function("allocate_one_unit_from_100_lots", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let store = Arc::new(InMemoryInventoryStore::new());
                    let product = store
                        .register_product(NewProduct {
                            product_id: ProductId::new(),
                            sku: "BENCH".into(),
                            name: "Bench".into(),
                            reorder_threshold: 0,
                            occurred_at: Utc::now(),
                        })
                        .await
                        .expect("product");
                    let location = store
                        .register_location(NewLocation {
                            location_id: LocationId::new(),
                            name: "Main".into(),
                            is_primary: true,
                        })
                        .await
                        .expect("location");
                    for lot in lots(product.id, location.id, 100) {
                        store.receive_batch(lot, None).await.expect("lot");
                    }
                    (
                        BatchLedger::new(store, LedgerConfig::default()),
                        product.id,
                        location.id,
                    )
                })
            },
            |(ledger, product_id, location_id)| {
                rt.block_on(ledger.allocate_stock_from_batches(AllocationRequest::sale(
                    product_id,
                    location_id,
                    1,
                    Utc::now(),
                )))
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_plan_building, bench_in_memory_allocation);
criterion_main!(benches);

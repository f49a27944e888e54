//! Postgres-backed ledger store.
//!
//! Every write runs in one transaction. Rows a write depends on are locked
//! with `SELECT ... FOR UPDATE` (batches in id order, then the product row)
//! so concurrent allocations against the same batches serialize; a plan whose
//! batch versions moved in the meantime is rejected with a conflict and
//! re-planned by the allocator. Dropping an uncommitted transaction rolls it
//! back, so an early `?` leaves no partial trace.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError |
//! |------------|----------------------|-------------|
//! | Database (unique violation) | `23505` | `DuplicateSerialNumber` on serial inserts, `ConcurrencyConflict` elsewhere |
//! | Database (serialization failure) | `40001` | `ConcurrencyConflict` |
//! | Database (deadlock detected) | `40P01` | `ConcurrencyConflict` |
//! | Database (lock not available) | `55P03` | `ConcurrencyConflict` |
//! | Database (check / foreign key violation) | `23514` / `23503` | `Validation` |
//! | Database (numeric value out of range) | `22003` | `InvalidQuantity` |
//! | Database (other), PoolClosed, Io, ... | any | `Storage` |

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, info, instrument};
use uuid::Uuid;

use stockledger_core::{
    BatchId, HistoryEntryId, LedgerError, LedgerResult, LocationId, MovementId, ProductId,
    SerialNumberId, StockLevelId, SupplierId, UserId, VariantId,
};
use stockledger_inventory::{
    AdjustBatch, AdjustQuantity, Allocation, AllocationPlan, AllocationRequest, Batch,
    BatchAdjustment, BatchHistoryEntry, BatchTransfer, BatchTransferOutcome, ChangeSerialStatus,
    ChangeType, CreateSerialNumbers, ExpiringBatch, LedgerChange, Location, LowStockItem,
    MovementReason, NewBatch, NewLocation, NewProduct, Product, SerialNumber, SerialStatus,
    SerialTransition, StockLevel, StockMovement, TransferOutcome, TransferQuantity, apply_delta,
    check_total, expiry_report, sort_fefo,
};

use super::{InventoryStore, Provenance, check_plan, stage_draws};

const BATCH_COLUMNS: &str = "id, product_id, variant_id, location_id, batch_number, expiry_date, \
     manufacturing_date, initial_quantity, current_quantity, unit_cost, supplier_id, active, \
     created_at, version";

const SERIAL_COLUMNS: &str = "id, product_id, batch_id, stock_level_id, serial_number, status, \
     warranty_expiry, unit_cost, sold_at, created_at, updated_at";

const SERIAL_UNIQUE_CONSTRAINT: &str = "serial_numbers_product_serial_key";

/// Postgres-backed ledger store.
///
/// `Send + Sync`; all operations go through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Connect using `DATABASE_URL`.
    pub async fn connect_from_env() -> LedgerResult<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| LedgerError::storage("DATABASE_URL is not set"))?;
        Self::connect(&url).await
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| LedgerError::storage(format!("migration failed: {e}")))?;
        info!("stock ledger migrations applied");
        Ok(())
    }

    async fn begin(&self) -> LedgerResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn conn(&self) -> LedgerResult<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> LedgerResult<()> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

// Ledger writes

/// Lock the product row and return its cached total.
async fn lock_product_total(conn: &mut PgConnection, product_id: ProductId) -> LedgerResult<i64> {
    let row = sqlx::query("SELECT total_quantity FROM products WHERE id = $1 FOR UPDATE")
        .bind(product_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_product", e))?
        .ok_or_else(|| LedgerError::not_found("product", product_id))?;
    col(&row, "total_quantity")
}

async fn ensure_location(conn: &mut PgConnection, location_id: LocationId) -> LedgerResult<()> {
    let exists: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM locations WHERE id = $1) AS found")
        .bind(location_id.as_uuid())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_location", e))
        .and_then(|row| col(&row, "found"))?;
    if exists {
        Ok(())
    } else {
        Err(LedgerError::not_found("location", location_id))
    }
}

async fn ensure_product(conn: &mut PgConnection, product_id: ProductId) -> LedgerResult<()> {
    let exists: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM products WHERE id = $1) AS found")
        .bind(product_id.as_uuid())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_product", e))
        .and_then(|row| col(&row, "found"))?;
    if exists {
        Ok(())
    } else {
        Err(LedgerError::not_found("product", product_id))
    }
}

async fn ensure_stock_level(conn: &mut PgConnection, level_id: StockLevelId) -> LedgerResult<()> {
    let exists: bool =
        sqlx::query("SELECT EXISTS (SELECT 1 FROM stock_levels WHERE id = $1) AS found")
            .bind(level_id.as_uuid())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("ensure_stock_level", e))
            .and_then(|row| col(&row, "found"))?;
    if exists {
        Ok(())
    } else {
        Err(LedgerError::not_found("stock level", level_id))
    }
}

/// Change one (product, location) quantity, log the movement and reconcile
/// the product total from its level rows.
async fn ledger_write(
    conn: &mut PgConnection,
    product_id: ProductId,
    location_id: LocationId,
    delta: i64,
    allow_negative: bool,
    by: Provenance,
) -> LedgerResult<LedgerChange> {
    let previous_total = lock_product_total(conn, product_id).await?;
    ensure_location(conn, location_id).await?;

    let previous: i64 = sqlx::query(
        "SELECT quantity FROM stock_levels WHERE product_id = $1 AND location_id = $2 FOR UPDATE",
    )
    .bind(product_id.as_uuid())
    .bind(location_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_stock_level", e))?
    .map(|row| col(&row, "quantity"))
    .transpose()?
    .unwrap_or(0);

    let next = apply_delta(product_id, location_id, previous, delta, allow_negative)?;
    check_total(product_id, previous_total, delta)?;

    sqlx::query(
        r#"
        INSERT INTO stock_levels (id, product_id, location_id, quantity, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (product_id, location_id)
        DO UPDATE SET quantity = EXCLUDED.quantity, updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(StockLevelId::new().as_uuid())
    .bind(product_id.as_uuid())
    .bind(location_id.as_uuid())
    .bind(next)
    .bind(by.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("upsert_stock_level", e))?;

    let movement = StockMovement::record(
        product_id,
        location_id,
        previous,
        next - previous,
        by.reason,
        by.reference,
        by.actor,
        by.occurred_at,
    );
    insert_movement(conn, &movement).await?;

    let new_total = reconcile(conn, product_id).await?;
    Ok(LedgerChange {
        product_id,
        location_id,
        previous_quantity: previous,
        new_quantity: next,
        previous_total,
        new_total,
    })
}

/// Recompute and persist the cached total as the sum of the level rows.
async fn reconcile(conn: &mut PgConnection, product_id: ProductId) -> LedgerResult<i64> {
    let row = sqlx::query(
        r#"
        UPDATE products
        SET total_quantity = (
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM stock_levels
            WHERE product_id = $1
        )
        WHERE id = $1
        RETURNING total_quantity
        "#,
    )
    .bind(product_id.as_uuid())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("reconcile_total", e))?;
    col(&row, "total_quantity")
}

async fn insert_movement(conn: &mut PgConnection, m: &StockMovement) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO stock_movements (
            id, product_id, location_id, previous_quantity, quantity_change,
            new_quantity, reason, reference, actor_id, occurred_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(m.id.as_uuid())
    .bind(m.product_id.as_uuid())
    .bind(m.location_id.as_uuid())
    .bind(m.previous_quantity)
    .bind(m.quantity_change)
    .bind(m.new_quantity)
    .bind(m.reason.as_str())
    .bind(m.reference.as_deref())
    .bind(m.actor.map(|a| *a.as_uuid()))
    .bind(m.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_movement", e))?;
    Ok(())
}

// Batch rows

async fn insert_batch(conn: &mut PgConnection, b: &Batch) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO batches (
            id, product_id, variant_id, location_id, batch_number, expiry_date,
            manufacturing_date, initial_quantity, current_quantity, unit_cost,
            supplier_id, active, created_at, version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(b.id.as_uuid())
    .bind(b.product_id.as_uuid())
    .bind(b.variant_id.map(|v| *v.as_uuid()))
    .bind(b.location_id.map(|l| *l.as_uuid()))
    .bind(&b.batch_number)
    .bind(b.expiry_date)
    .bind(b.manufacturing_date)
    .bind(b.initial_quantity)
    .bind(b.current_quantity)
    .bind(b.unit_cost)
    .bind(b.supplier_id.map(|s| *s.as_uuid()))
    .bind(b.active)
    .bind(b.created_at)
    .bind(b.version as i64)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_batch", e))?;
    Ok(())
}

async fn update_batch_quantity(conn: &mut PgConnection, b: &Batch) -> LedgerResult<()> {
    sqlx::query("UPDATE batches SET current_quantity = $2, version = $3 WHERE id = $1")
        .bind(b.id.as_uuid())
        .bind(b.current_quantity)
        .bind(b.version as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_batch", e))?;
    Ok(())
}

async fn insert_history(conn: &mut PgConnection, e: &BatchHistoryEntry) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_history (
            id, batch_id, previous_quantity, quantity_change, new_quantity,
            change_type, reference, actor_id, occurred_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(e.id.as_uuid())
    .bind(e.batch_id.as_uuid())
    .bind(e.previous_quantity)
    .bind(e.quantity_change)
    .bind(e.new_quantity)
    .bind(e.change_type.as_str())
    .bind(e.reference.as_deref())
    .bind(e.actor.map(|a| *a.as_uuid()))
    .bind(e.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_batch_history", e))?;
    Ok(())
}

/// Lock the batch rows a plan draws from, in id order.
async fn lock_batches(
    conn: &mut PgConnection,
    plan: &AllocationPlan,
) -> LedgerResult<HashMap<BatchId, Batch>> {
    let ids: Vec<Uuid> = plan.draws.iter().map(|d| *d.batch_id.as_uuid()).collect();
    let rows = sqlx::query(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches WHERE id = ANY($1) ORDER BY id FOR UPDATE"
    ))
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_batches", e))?;

    rows.iter()
        .map(|row| decode_batch(row).map(|b| (b.id, b)))
        .collect()
}

/// Apply a plan's batch side: checked decrements plus one history row each.
async fn apply_draws(
    conn: &mut PgConnection,
    plan: &AllocationPlan,
    request: &AllocationRequest,
) -> LedgerResult<()> {
    let locked = lock_batches(conn, plan).await?;
    let staged = stage_draws(plan, |id| {
        locked
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("batch", id))
    })?;
    for batch in &staged {
        update_batch_quantity(conn, batch).await?;
    }
    for entry in plan.history_entries(request) {
        insert_history(conn, &entry).await?;
    }
    Ok(())
}

// Row decoding

fn col<'r, T>(row: &'r PgRow, name: &str) -> LedgerResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| LedgerError::storage(format!("failed to read column {name}: {e}")))
}

fn decode_product(row: &PgRow) -> LedgerResult<Product> {
    Ok(Product {
        id: ProductId::from_uuid(col(row, "id")?),
        sku: col(row, "sku")?,
        name: col(row, "name")?,
        reorder_threshold: col(row, "reorder_threshold")?,
        total_quantity: col(row, "total_quantity")?,
        created_at: col(row, "created_at")?,
    })
}

fn decode_location(row: &PgRow) -> LedgerResult<Location> {
    Ok(Location {
        id: LocationId::from_uuid(col(row, "id")?),
        name: col(row, "name")?,
        is_primary: col(row, "is_primary")?,
    })
}

fn decode_stock_level(row: &PgRow) -> LedgerResult<StockLevel> {
    Ok(StockLevel {
        id: StockLevelId::from_uuid(col(row, "id")?),
        product_id: ProductId::from_uuid(col(row, "product_id")?),
        location_id: LocationId::from_uuid(col(row, "location_id")?),
        quantity: col(row, "quantity")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn decode_movement(row: &PgRow) -> LedgerResult<StockMovement> {
    let reason: String = col(row, "reason")?;
    Ok(StockMovement {
        id: MovementId::from_uuid(col(row, "id")?),
        product_id: ProductId::from_uuid(col(row, "product_id")?),
        location_id: LocationId::from_uuid(col(row, "location_id")?),
        previous_quantity: col(row, "previous_quantity")?,
        quantity_change: col(row, "quantity_change")?,
        new_quantity: col(row, "new_quantity")?,
        reason: MovementReason::parse(&reason)
            .ok_or_else(|| LedgerError::storage(format!("unknown movement reason '{reason}'")))?,
        reference: col(row, "reference")?,
        actor: col::<Option<Uuid>>(row, "actor_id")?.map(UserId::from_uuid),
        occurred_at: col(row, "occurred_at")?,
    })
}

fn decode_batch(row: &PgRow) -> LedgerResult<Batch> {
    Ok(Batch {
        id: BatchId::from_uuid(col(row, "id")?),
        product_id: ProductId::from_uuid(col(row, "product_id")?),
        variant_id: col::<Option<Uuid>>(row, "variant_id")?.map(VariantId::from_uuid),
        location_id: col::<Option<Uuid>>(row, "location_id")?.map(LocationId::from_uuid),
        batch_number: col(row, "batch_number")?,
        expiry_date: col(row, "expiry_date")?,
        manufacturing_date: col(row, "manufacturing_date")?,
        initial_quantity: col(row, "initial_quantity")?,
        current_quantity: col(row, "current_quantity")?,
        unit_cost: col(row, "unit_cost")?,
        supplier_id: col::<Option<Uuid>>(row, "supplier_id")?.map(SupplierId::from_uuid),
        active: col(row, "active")?,
        created_at: col(row, "created_at")?,
        version: col::<i64>(row, "version")? as u64,
    })
}

fn decode_history(row: &PgRow) -> LedgerResult<BatchHistoryEntry> {
    let change_type: String = col(row, "change_type")?;
    Ok(BatchHistoryEntry {
        id: HistoryEntryId::from_uuid(col(row, "id")?),
        batch_id: BatchId::from_uuid(col(row, "batch_id")?),
        previous_quantity: col(row, "previous_quantity")?,
        quantity_change: col(row, "quantity_change")?,
        new_quantity: col(row, "new_quantity")?,
        change_type: ChangeType::parse(&change_type)
            .ok_or_else(|| LedgerError::storage(format!("unknown change type '{change_type}'")))?,
        reference: col(row, "reference")?,
        actor: col::<Option<Uuid>>(row, "actor_id")?.map(UserId::from_uuid),
        occurred_at: col(row, "occurred_at")?,
    })
}

fn decode_serial(row: &PgRow) -> LedgerResult<SerialNumber> {
    let status: String = col(row, "status")?;
    Ok(SerialNumber {
        id: SerialNumberId::from_uuid(col(row, "id")?),
        product_id: ProductId::from_uuid(col(row, "product_id")?),
        batch_id: col::<Option<Uuid>>(row, "batch_id")?.map(BatchId::from_uuid),
        stock_level_id: col::<Option<Uuid>>(row, "stock_level_id")?.map(StockLevelId::from_uuid),
        serial_number: col(row, "serial_number")?,
        status: SerialStatus::parse(&status)
            .ok_or_else(|| LedgerError::storage(format!("unknown serial status '{status}'")))?,
        warranty_expiry: col::<Option<DateTime<Utc>>>(row, "warranty_expiry")?,
        unit_cost: col(row, "unit_cost")?,
        sold_at: col(row, "sold_at")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn decode_all<T>(rows: &[PgRow], decode: fn(&PgRow) -> LedgerResult<T>) -> LedgerResult<Vec<T>> {
    rows.iter().map(decode).collect()
}

/// Map SQLx errors to LedgerError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => LedgerError::conflict(msg),
                Some("40001") | Some("40P01") | Some("55P03") => LedgerError::conflict(msg),
                Some("23503") | Some("23514") => LedgerError::validation(msg),
                Some("22003") => LedgerError::invalid_quantity(msg),
                _ => LedgerError::storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            LedgerError::storage(format!("unexpected row not found in {operation}"))
        }
        _ => LedgerError::storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Whether an error is the unique violation guarding (product, serial).
fn is_duplicate_serial(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505")
            && db_err.constraint() == Some(SERIAL_UNIQUE_CONSTRAINT);
    }
    false
}

#[async_trait::async_trait]
impl InventoryStore for PostgresInventoryStore {
    #[instrument(skip(self, product), fields(product_id = %product.product_id, sku = %product.sku), err)]
    async fn register_product(&self, product: NewProduct) -> LedgerResult<Product> {
        product.validate()?;
        let mut tx = self.begin().await?;
        let taken: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM products WHERE sku = $1) AS found")
            .bind(&product.sku)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("check_sku", e))
            .and_then(|row| col(&row, "found"))?;
        if taken {
            return Err(LedgerError::validation(format!(
                "sku '{}' already registered",
                product.sku
            )));
        }

        let product = product.into_product();
        sqlx::query(
            r#"
            INSERT INTO products (id, sku, name, reorder_threshold, total_quantity, created_at)
            VALUES ($1, $2, $3, $4, 0, $5)
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.reorder_threshold)
        .bind(product.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;

        commit(tx).await?;
        Ok(product)
    }

    #[instrument(skip(self, location), fields(location_id = %location.location_id), err)]
    async fn register_location(&self, location: NewLocation) -> LedgerResult<Location> {
        location.validate()?;
        let location = location.into_location();
        let mut tx = self.begin().await?;
        if location.is_primary {
            sqlx::query("UPDATE locations SET is_primary = FALSE WHERE is_primary")
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("demote_primary", e))?;
        }
        sqlx::query("INSERT INTO locations (id, name, is_primary) VALUES ($1, $2, $3)")
            .bind(location.id.as_uuid())
            .bind(&location.name)
            .bind(location.is_primary)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_location", e))?;
        commit(tx).await?;
        Ok(location)
    }

    async fn get_product(&self, product_id: ProductId) -> LedgerResult<Product> {
        let row = sqlx::query(
            "SELECT id, sku, name, reorder_threshold, total_quantity, created_at FROM products WHERE id = $1",
        )
        .bind(product_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product", e))?
        .ok_or_else(|| LedgerError::not_found("product", product_id))?;
        decode_product(&row)
    }

    async fn get_location(&self, location_id: LocationId) -> LedgerResult<Location> {
        let row = sqlx::query("SELECT id, name, is_primary FROM locations WHERE id = $1")
            .bind(location_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_location", e))?
            .ok_or_else(|| LedgerError::not_found("location", location_id))?;
        decode_location(&row)
    }

    async fn list_locations(&self) -> LedgerResult<Vec<Location>> {
        let rows = sqlx::query("SELECT id, name, is_primary FROM locations ORDER BY name, id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_locations", e))?;
        decode_all(&rows, decode_location)
    }

    async fn low_stock_products(&self) -> LedgerResult<Vec<LowStockItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sku, name, reorder_threshold, total_quantity, created_at
            FROM products
            WHERE total_quantity <= reorder_threshold
            ORDER BY sku
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("low_stock_products", e))?;
        Ok(decode_all(&rows, decode_product)?
            .iter()
            .map(LowStockItem::from)
            .collect())
    }

    #[instrument(
        skip(self, cmd),
        fields(
            product_id = %cmd.product_id,
            location_id = %cmd.location_id,
            delta = cmd.delta,
            reason = %cmd.reason
        ),
        err
    )]
    async fn adjust_quantity(
        &self,
        cmd: AdjustQuantity,
        allow_negative: bool,
    ) -> LedgerResult<LedgerChange> {
        let mut tx = self.begin().await?;
        let change = ledger_write(
            &mut tx,
            cmd.product_id,
            cmd.location_id,
            cmd.delta,
            allow_negative,
            Provenance {
                reason: cmd.reason,
                reference: cmd.reference,
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            },
        )
        .await?;
        commit(tx).await?;
        Ok(change)
    }

    #[instrument(
        skip(self, cmd),
        fields(product_id = %cmd.product_id, from = %cmd.from_location, to = %cmd.to_location, quantity = cmd.quantity),
        err
    )]
    async fn transfer_quantity(
        &self,
        cmd: TransferQuantity,
        allow_negative: bool,
    ) -> LedgerResult<TransferOutcome> {
        cmd.validate()?;
        let by = |reason| Provenance {
            reason,
            reference: cmd.reference.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        };
        let mut tx = self.begin().await?;
        let source = ledger_write(
            &mut tx,
            cmd.product_id,
            cmd.from_location,
            -cmd.quantity,
            allow_negative,
            by(MovementReason::TransferOut),
        )
        .await?;
        let destination = ledger_write(
            &mut tx,
            cmd.product_id,
            cmd.to_location,
            cmd.quantity,
            allow_negative,
            by(MovementReason::TransferIn),
        )
        .await?;
        commit(tx).await?;
        Ok(TransferOutcome {
            source,
            destination,
        })
    }

    async fn quantity_at(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<i64> {
        let row = sqlx::query(
            "SELECT quantity FROM stock_levels WHERE product_id = $1 AND location_id = $2",
        )
        .bind(product_id.as_uuid())
        .bind(location_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("quantity_at", e))?;
        Ok(row.map(|r| col(&r, "quantity")).transpose()?.unwrap_or(0))
    }

    async fn total_quantity(&self, product_id: ProductId) -> LedgerResult<i64> {
        let row = sqlx::query("SELECT total_quantity FROM products WHERE id = $1")
            .bind(product_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("total_quantity", e))?;
        Ok(row.map(|r| col(&r, "total_quantity")).transpose()?.unwrap_or(0))
    }

    async fn list_stock_levels(&self, product_id: ProductId) -> LedgerResult<Vec<StockLevel>> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, location_id, quantity, updated_at
            FROM stock_levels
            WHERE product_id = $1
            ORDER BY location_id
            "#,
        )
        .bind(product_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stock_levels", e))?;
        decode_all(&rows, decode_stock_level)
    }

    async fn movement_history(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<StockMovement>> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, location_id, previous_quantity, quantity_change,
                   new_quantity, reason, reference, actor_id, occurred_at
            FROM stock_movements
            WHERE product_id = $1 AND location_id = $2
            ORDER BY seq ASC
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(location_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movement_history", e))?;
        decode_all(&rows, decode_movement)
    }

    #[instrument(skip(self), fields(location_id = %location_id, removed_levels = tracing::field::Empty), err)]
    async fn delete_location(&self, location_id: LocationId) -> LedgerResult<Vec<LedgerChange>> {
        let mut tx = self.begin().await?;
        ensure_location(&mut tx, location_id).await?;

        // Same order as allocations and ledger writes: batches, products, then
        // the location and its levels.
        sqlx::query("SELECT id FROM batches WHERE location_id = $1 AND active ORDER BY id FOR UPDATE")
            .bind(location_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_location_batches", e))?;
        sqlx::query(
            r#"
            SELECT id FROM products
            WHERE id IN (SELECT product_id FROM stock_levels WHERE location_id = $1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(location_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_location_products", e))?;
        sqlx::query("SELECT id FROM locations WHERE id = $1 FOR UPDATE")
            .bind(location_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_location", e))?
            .ok_or_else(|| LedgerError::not_found("location", location_id))?;

        let rows = sqlx::query(
            r#"
            SELECT id, product_id, location_id, quantity, updated_at
            FROM stock_levels
            WHERE location_id = $1
            ORDER BY product_id
            FOR UPDATE
            "#,
        )
        .bind(location_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_location_levels", e))?;
        let levels = decode_all(&rows, decode_stock_level)?;

        let occurred_at = Utc::now();
        let mut changes = Vec::with_capacity(levels.len());
        for level in levels {
            let previous_total = lock_product_total(&mut tx, level.product_id).await?;
            let movement = StockMovement::record(
                level.product_id,
                location_id,
                level.quantity,
                -level.quantity,
                MovementReason::LocationRemoved,
                None,
                None,
                occurred_at,
            );
            insert_movement(&mut tx, &movement).await?;

            sqlx::query(
                "UPDATE serial_numbers SET stock_level_id = NULL, updated_at = $2 WHERE stock_level_id = $1",
            )
            .bind(level.id.as_uuid())
            .bind(occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("unbind_serials", e))?;

            sqlx::query("DELETE FROM stock_levels WHERE id = $1")
                .bind(level.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_stock_level", e))?;

            let new_total = reconcile(&mut tx, level.product_id).await?;
            changes.push(LedgerChange {
                product_id: level.product_id,
                location_id,
                previous_quantity: level.quantity,
                new_quantity: 0,
                previous_total,
                new_total,
            });
        }

        sqlx::query(
            "UPDATE batches SET active = FALSE, version = version + 1 WHERE location_id = $1 AND active",
        )
        .bind(location_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("deactivate_batches", e))?;

        sqlx::query("DELETE FROM locations WHERE id = $1")
            .bind(location_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_location", e))?;

        commit(tx).await?;
        Span::current().record("removed_levels", changes.len());
        Ok(changes)
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id, product_id = %batch.product_id), err)]
    async fn create_batch(&self, batch: NewBatch) -> LedgerResult<Batch> {
        batch.validate()?;
        let mut tx = self.begin().await?;
        ensure_product(&mut tx, batch.product_id).await?;
        if let Some(location_id) = batch.location_id {
            ensure_location(&mut tx, location_id).await?;
        }
        let batch = batch.into_batch();
        insert_batch(&mut tx, &batch).await?;
        commit(tx).await?;
        Ok(batch)
    }

    #[instrument(skip(self, batch, actor), fields(batch_id = %batch.batch_id, product_id = %batch.product_id), err)]
    async fn receive_batch(
        &self,
        batch: NewBatch,
        actor: Option<UserId>,
    ) -> LedgerResult<(Batch, LedgerChange)> {
        batch.validate()?;
        let location_id = batch
            .location_id
            .ok_or_else(|| LedgerError::validation("receiving a batch requires a location"))?;
        let batch = batch.into_batch();

        let mut tx = self.begin().await?;
        ensure_product(&mut tx, batch.product_id).await?;
        ensure_location(&mut tx, location_id).await?;
        insert_batch(&mut tx, &batch).await?;
        let change = ledger_write(
            &mut tx,
            batch.product_id,
            location_id,
            batch.initial_quantity,
            true,
            Provenance {
                reason: MovementReason::Receipt,
                reference: Some(batch.batch_number.clone()),
                actor,
                occurred_at: batch.created_at,
            },
        )
        .await?;
        commit(tx).await?;
        Ok((batch, change))
    }

    async fn get_batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"))
            .bind(batch_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_batch", e))?
            .ok_or_else(|| LedgerError::not_found("batch", batch_id))?;
        decode_batch(&row)
    }

    async fn list_batches(&self, product_id: ProductId) -> LedgerResult<Vec<Batch>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM batches
            WHERE product_id = $1
            ORDER BY expiry_date ASC NULLS LAST, created_at ASC, id ASC
            "#
        ))
        .bind(product_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_batches", e))?;
        decode_all(&rows, decode_batch)
    }

    async fn has_active_batches(&self, product_id: ProductId) -> LedgerResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM batches WHERE product_id = $1 AND active) AS found",
        )
        .bind(product_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_active_batches", e))?;
        col(&row, "found")
    }

    async fn allocation_candidates(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<Vec<Batch>> {
        let mut conn = self.conn().await?;
        ensure_product(&mut conn, product_id).await?;
        ensure_location(&mut conn, location_id).await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM batches
            WHERE product_id = $1 AND location_id = $2 AND active AND current_quantity > 0
            ORDER BY expiry_date ASC NULLS LAST, created_at ASC, id ASC
            "#
        ))
        .bind(product_id.as_uuid())
        .bind(location_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("allocation_candidates", e))?;
        let mut batches = decode_all(&rows, decode_batch)?;
        sort_fefo(&mut batches);
        Ok(batches)
    }

    #[instrument(
        skip(self, plan, request),
        fields(product_id = %plan.product_id, location_id = %plan.location_id, requested = plan.requested, draws = plan.draws.len()),
        err
    )]
    async fn commit_allocation(
        &self,
        plan: &AllocationPlan,
        request: &AllocationRequest,
        allow_negative: bool,
    ) -> LedgerResult<Allocation> {
        check_plan(plan, request)?;
        let mut tx = self.begin().await?;
        apply_draws(&mut tx, plan, request).await?;
        let ledger = ledger_write(
            &mut tx,
            plan.product_id,
            plan.location_id,
            -plan.fulfilled(),
            allow_negative,
            Provenance {
                reason: request.change_type.movement_reason(),
                reference: request.reference.clone(),
                actor: request.actor,
                occurred_at: request.occurred_at,
            },
        )
        .await?;
        commit(tx).await?;
        Ok(Allocation {
            lines: plan.lines(),
            fulfilled: plan.fulfilled(),
            ledger,
        })
    }

    #[instrument(skip(self, cmd), fields(batch_id = %cmd.batch_id, delta = cmd.delta, change_type = %cmd.change_type), err)]
    async fn adjust_batch(
        &self,
        cmd: AdjustBatch,
        allow_negative: bool,
    ) -> LedgerResult<BatchAdjustment> {
        cmd.validate()?;
        let mut tx = self.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1 FOR UPDATE"
        ))
        .bind(cmd.batch_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_batch", e))?
        .ok_or_else(|| LedgerError::not_found("batch", cmd.batch_id))?;
        let mut batch = decode_batch(&row)?;
        if !batch.active {
            return Err(LedgerError::validation(format!(
                "batch {} is inactive",
                batch.batch_number
            )));
        }

        let entry = cmd.history_entry(batch.apply_change(cmd.delta)?);
        update_batch_quantity(&mut tx, &batch).await?;
        insert_history(&mut tx, &entry).await?;

        let ledger = match batch.location_id {
            Some(location_id) => Some(
                ledger_write(
                    &mut tx,
                    batch.product_id,
                    location_id,
                    cmd.delta,
                    allow_negative,
                    Provenance {
                        reason: cmd.change_type.movement_reason(),
                        reference: cmd.reference.clone(),
                        actor: cmd.actor,
                        occurred_at: cmd.occurred_at,
                    },
                )
                .await?,
            ),
            None => None,
        };
        commit(tx).await?;
        Ok(BatchAdjustment {
            batch,
            entry,
            ledger,
        })
    }

    #[instrument(
        skip(self, transfer, plan),
        fields(product_id = %transfer.product_id, from = %transfer.from_location, to = %transfer.to_location, quantity = transfer.quantity),
        err
    )]
    async fn commit_batch_transfer(
        &self,
        transfer: &BatchTransfer,
        plan: &AllocationPlan,
        allow_negative: bool,
    ) -> LedgerResult<BatchTransferOutcome> {
        transfer.validate()?;
        let request = transfer.source_request();
        check_plan(plan, &request)?;
        let destination_batches: Vec<Batch> = transfer
            .destination_batches(plan)
            .into_iter()
            .map(|b| b.validate().map(|_| b.into_batch()))
            .collect::<LedgerResult<_>>()?;

        let mut tx = self.begin().await?;
        ensure_location(&mut tx, transfer.to_location).await?;
        apply_draws(&mut tx, plan, &request).await?;
        for batch in &destination_batches {
            insert_batch(&mut tx, batch).await?;
        }

        let by = |reason| Provenance {
            reason,
            reference: transfer.reference.clone(),
            actor: transfer.actor,
            occurred_at: transfer.occurred_at,
        };
        let source = ledger_write(
            &mut tx,
            transfer.product_id,
            transfer.from_location,
            -plan.fulfilled(),
            allow_negative,
            by(MovementReason::TransferOut),
        )
        .await?;
        let destination = ledger_write(
            &mut tx,
            transfer.product_id,
            transfer.to_location,
            plan.fulfilled(),
            allow_negative,
            by(MovementReason::TransferIn),
        )
        .await?;
        commit(tx).await?;

        Ok(BatchTransferOutcome {
            lines: plan.lines(),
            destination_batches,
            ledger: TransferOutcome {
                source,
                destination,
            },
        })
    }

    async fn batch_history(&self, batch_id: BatchId) -> LedgerResult<Vec<BatchHistoryEntry>> {
        let mut conn = self.conn().await?;
        let exists: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM batches WHERE id = $1) AS found")
            .bind(batch_id.as_uuid())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("check_batch", e))
            .and_then(|row| col(&row, "found"))?;
        if !exists {
            return Err(LedgerError::not_found("batch", batch_id));
        }
        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, previous_quantity, quantity_change, new_quantity,
                   change_type, reference, actor_id, occurred_at
            FROM batch_history
            WHERE batch_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("batch_history", e))?;
        decode_all(&rows, decode_history)
    }

    async fn expiry_report(
        &self,
        today: NaiveDate,
        threshold_days: u32,
    ) -> LedgerResult<Vec<ExpiringBatch>> {
        let rows = sqlx::query(
            r#"
            SELECT b.id, b.product_id, b.variant_id, b.location_id, b.batch_number,
                   b.expiry_date, b.manufacturing_date, b.initial_quantity,
                   b.current_quantity, b.unit_cost, b.supplier_id, b.active,
                   b.created_at, b.version,
                   p.name AS product_name, l.name AS location_name
            FROM batches b
            JOIN products p ON p.id = b.product_id
            LEFT JOIN locations l ON l.id = b.location_id
            WHERE b.active AND b.current_quantity > 0 AND b.expiry_date IS NOT NULL
            ORDER BY b.expiry_date ASC, b.id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expiry_report", e))?;

        let mut batches = Vec::with_capacity(rows.len());
        let mut product_names = HashMap::new();
        let mut location_names = HashMap::new();
        for row in &rows {
            let batch = decode_batch(row)?;
            product_names.insert(batch.product_id, col::<String>(row, "product_name")?);
            if let (Some(location_id), Some(name)) =
                (batch.location_id, col::<Option<String>>(row, "location_name")?)
            {
                location_names.insert(location_id, name);
            }
            batches.push(batch);
        }

        Ok(expiry_report(
            &batches,
            |p| product_names.get(&p).cloned(),
            |l| location_names.get(&l).cloned(),
            today,
            threshold_days,
        ))
    }

    #[instrument(skip(self, cmd), fields(product_id = %cmd.product_id, count = cmd.serials.len()), err)]
    async fn create_serial_numbers(
        &self,
        cmd: CreateSerialNumbers,
    ) -> LedgerResult<Vec<SerialNumber>> {
        let rows = cmd.build()?;
        let mut tx = self.begin().await?;
        ensure_product(&mut tx, cmd.product_id).await?;
        if let Some(level_id) = cmd.stock_level_id {
            ensure_stock_level(&mut tx, level_id).await?;
        }
        if let Some(batch_id) = cmd.batch_id {
            let exists: bool =
                sqlx::query("SELECT EXISTS (SELECT 1 FROM batches WHERE id = $1) AS found")
                    .bind(batch_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("check_batch", e))
                    .and_then(|row| col(&row, "found"))?;
            if !exists {
                return Err(LedgerError::not_found("batch", batch_id));
            }
        }

        let wanted: Vec<&str> = rows.iter().map(|r| r.serial_number.as_str()).collect();
        let taken = sqlx::query(
            r#"
            SELECT serial_number FROM serial_numbers
            WHERE product_id = $1 AND serial_number = ANY($2)
            ORDER BY serial_number
            LIMIT 1
            "#,
        )
        .bind(cmd.product_id.as_uuid())
        .bind(&wanted)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("check_serials", e))?;
        if let Some(row) = taken {
            return Err(LedgerError::DuplicateSerialNumber {
                product_id: cmd.product_id,
                serial_number: col(&row, "serial_number")?,
            });
        }

        for s in &rows {
            sqlx::query(&format!(
                "INSERT INTO serial_numbers ({SERIAL_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
            ))
            .bind(s.id.as_uuid())
            .bind(s.product_id.as_uuid())
            .bind(s.batch_id.map(|b| *b.as_uuid()))
            .bind(s.stock_level_id.map(|l| *l.as_uuid()))
            .bind(&s.serial_number)
            .bind(s.status.as_str())
            .bind(s.warranty_expiry)
            .bind(s.unit_cost)
            .bind(s.sold_at)
            .bind(s.created_at)
            .bind(s.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_duplicate_serial(&e) {
                    LedgerError::DuplicateSerialNumber {
                        product_id: s.product_id,
                        serial_number: s.serial_number.clone(),
                    }
                } else {
                    map_sqlx_error("insert_serial", e)
                }
            })?;
        }

        commit(tx).await?;
        Ok(rows)
    }

    #[instrument(skip(self, cmd), fields(serial_id = %cmd.serial_id, to = %cmd.to), err)]
    async fn transition_serial(&self, cmd: ChangeSerialStatus) -> LedgerResult<SerialTransition> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {SERIAL_COLUMNS} FROM serial_numbers WHERE id = $1 FOR UPDATE"
        ))
        .bind(cmd.serial_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_serial", e))?
        .ok_or_else(|| LedgerError::not_found("serial number", cmd.serial_id))?;
        let mut serial = decode_serial(&row)?;
        if let Some(level_id) = cmd.stock_level_id {
            ensure_stock_level(&mut tx, level_id).await?;
        }

        let transition = serial.transition(cmd.to, cmd.stock_level_id, cmd.occurred_at)?;
        sqlx::query(
            r#"
            UPDATE serial_numbers
            SET status = $2, stock_level_id = $3, sold_at = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(serial.id.as_uuid())
        .bind(serial.status.as_str())
        .bind(serial.stock_level_id.map(|l| *l.as_uuid()))
        .bind(serial.sold_at)
        .bind(serial.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_serial", e))?;
        commit(tx).await?;
        Ok(transition)
    }

    async fn get_serial(&self, serial_id: SerialNumberId) -> LedgerResult<SerialNumber> {
        let row = sqlx::query(&format!(
            "SELECT {SERIAL_COLUMNS} FROM serial_numbers WHERE id = $1"
        ))
        .bind(serial_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_serial", e))?
        .ok_or_else(|| LedgerError::not_found("serial number", serial_id))?;
        decode_serial(&row)
    }

    async fn find_serial(
        &self,
        product_id: ProductId,
        serial_number: &str,
    ) -> LedgerResult<Option<SerialNumber>> {
        let row = sqlx::query(&format!(
            "SELECT {SERIAL_COLUMNS} FROM serial_numbers WHERE product_id = $1 AND serial_number = $2"
        ))
        .bind(product_id.as_uuid())
        .bind(serial_number.trim())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_serial", e))?;
        row.as_ref().map(decode_serial).transpose()
    }

    async fn list_serials(
        &self,
        product_id: ProductId,
        status: Option<SerialStatus>,
    ) -> LedgerResult<Vec<SerialNumber>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SERIAL_COLUMNS}
            FROM serial_numbers
            WHERE product_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY serial_number
            "#
        ))
        .bind(product_id.as_uuid())
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_serials", e))?;
        decode_all(&rows, decode_serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs against a live database: `DATABASE_URL=... cargo test -- --ignored`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn deleting_a_location_under_write_load_never_deadlocks() {
        let store = Arc::new(PostgresInventoryStore::connect_from_env().await.unwrap());
        store.migrate().await.unwrap();

        let product = store
            .register_product(NewProduct {
                product_id: ProductId::new(),
                sku: format!("DEL-{}", ProductId::new()),
                name: "Delete under load".into(),
                reorder_threshold: 0,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap()
            .id;
        let doomed = store
            .register_location(NewLocation {
                location_id: LocationId::new(),
                name: "Doomed".into(),
                is_primary: false,
            })
            .await
            .unwrap()
            .id;
        let adjust = move |location_id| AdjustQuantity {
            product_id: product,
            location_id,
            delta: 1,
            reason: MovementReason::Receipt,
            reference: None,
            actor: None,
            occurred_at: Utc::now(),
        };
        store.adjust_quantity(adjust(doomed), false).await.unwrap();

        let writers: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.adjust_quantity(adjust(doomed), false).await })
            })
            .collect();
        let deleted = store.delete_location(doomed).await.unwrap();
        assert_eq!(deleted.len(), 1);

        for writer in writers {
            match writer.await.unwrap() {
                Ok(_) | Err(LedgerError::NotFound { .. }) | Err(LedgerError::Validation(_)) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        let levels = store.list_stock_levels(product).await.unwrap();
        assert_eq!(
            store.total_quantity(product).await.unwrap(),
            levels.iter().map(|l| l.quantity).sum::<i64>()
        );
    }
}

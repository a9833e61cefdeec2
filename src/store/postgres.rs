//! Postgres store.
//!
//! Aggregates live as JSONB documents next to the columns that are queried or
//! constrained. Stock batches lock the affected product rows with
//! `SELECT ... FOR UPDATE` (always in id order) inside one transaction, and
//! the `stock_quantity >= 0` check constraint backs the in-process check.
//!
//! Carts, orders, payments and shipments carry a `version` column. Updates
//! are conditional on it, and the row lock they take is held until the
//! stock movements of the same unit are in.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;
use crate::domain::aggregates::{Cart, Order, Payment, Product, Shipment};
use crate::domain::ledger::{StockLedgerEntry, TransactionKind};
use crate::domain::value_objects::Sku;
use crate::error::{CommerceError, Result};
use super::{
    lock_order, CartRepository, LedgerRepository, OrderRepository, PaymentRepository, ProductRepository,
    ShipmentRepository, StockBatch, StockMovement, Store, UnitOfWork, Versioned,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self { Self { pool } }

    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    product_id: Uuid,
    kind: String,
    quantity_before: i64,
    quantity_after: i64,
    quantity_change: i64,
    reference_id: Option<String>,
    reason: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for StockLedgerEntry {
    type Error = CommerceError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        let quantity = |v: i64| u32::try_from(v).map_err(|_| CommerceError::Storage(format!("ledger entry {} has quantity {v}", row.id)));
        Ok(StockLedgerEntry {
            id: row.id,
            product_id: row.product_id,
            kind: TransactionKind::parse(&row.kind).ok_or_else(|| CommerceError::Storage(format!("unknown ledger kind {}", row.kind)))?,
            quantity_before: quantity(row.quantity_before)?,
            quantity_after: quantity(row.quantity_after)?,
            quantity_change: row.quantity_change,
            reference_id: row.reference_id,
            reason: row.reason,
            recorded_at: row.recorded_at,
        })
    }
}

async fn apply_in_tx(tx: &mut Transaction<'_, Postgres>, movements: &[StockMovement]) -> Result<StockBatch> {
    if movements.is_empty() { return Ok(StockBatch::default()); }
    let ids = lock_order(movements);
    let locked: Vec<Json<Product>> = sqlx::query_scalar("SELECT doc FROM products WHERE id = ANY($1) ORDER BY id FOR UPDATE")
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await?;
    let mut staged: BTreeMap<Uuid, Product> = locked.into_iter().map(|Json(p)| (p.id(), p)).collect();

    let mut entries = Vec::with_capacity(movements.len());
    for movement in movements {
        let product = staged.get_mut(&movement.product_id).ok_or_else(|| CommerceError::not_found("product", movement.product_id))?;
        entries.push(movement.apply(product)?);
    }

    for product in staged.values() {
        sqlx::query("UPDATE products SET stock_quantity = $2, doc = $3, updated_at = NOW() WHERE id = $1")
            .bind(product.id())
            .bind(i64::from(product.stock_quantity()))
            .bind(Json(product))
            .execute(&mut **tx)
            .await?;
    }
    for entry in &entries {
        sqlx::query(
            "INSERT INTO stock_ledger (id, product_id, kind, quantity_before, quantity_after, quantity_change, reference_id, reason, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(entry.product_id)
        .bind(entry.kind.as_str())
        .bind(i64::from(entry.quantity_before))
        .bind(i64::from(entry.quantity_after))
        .bind(entry.quantity_change)
        .bind(&entry.reference_id)
        .bind(&entry.reason)
        .bind(entry.recorded_at)
        .execute(&mut **tx)
        .await?;
    }
    debug!(entries = entries.len(), "ledger entries appended");
    Ok(StockBatch { products: staged.into_values().collect(), entries })
}

#[async_trait]
impl ProductRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Product>> {
        let row: Option<Json<Product>> = sqlx::query_scalar("SELECT doc FROM products WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn find_by_sku(&self, sku: &Sku) -> Result<Option<Product>> {
        let row: Option<Json<Product>> = sqlx::query_scalar("SELECT doc FROM products WHERE sku = $1").bind(sku.as_str()).fetch_optional(&self.pool).await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn save(&self, product: &Product) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE products SET reorder_point = $3, active = $4, doc = $5, updated_at = NOW() WHERE id = $1 AND stock_quantity = $2",
        )
        .bind(product.id())
        .bind(i64::from(product.stock_quantity()))
        .bind(i64::from(product.reorder_point()))
        .bind(product.is_active())
        .bind(Json(product))
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return match ProductRepository::find_by_id(self, product.id()).await? {
                Some(_) => Err(CommerceError::Conflict(format!("stock of {} changed concurrently", product.sku()))),
                None => Err(CommerceError::not_found("product", product.id())),
            };
        }
        Ok(())
    }

    async fn find_needing_reorder(&self) -> Result<Vec<Product>> {
        let rows: Vec<Json<Product>> = sqlx::query_scalar("SELECT doc FROM products WHERE active AND stock_quantity <= reorder_point ORDER BY stock_quantity")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(p)| p).collect())
    }
}

#[async_trait]
impl CartRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Cart>> {
        let row: Option<Json<Cart>> = sqlx::query_scalar("SELECT doc FROM carts WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|Json(c)| c))
    }

    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<Cart>> {
        let row: Option<Json<Cart>> = sqlx::query_scalar("SELECT doc FROM carts WHERE customer_id = $1 ORDER BY created_at DESC LIMIT 1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(c)| c))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM carts WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Cart>> {
        let rows: Vec<Json<Cart>> = sqlx::query_scalar("SELECT doc FROM carts WHERE expires_at IS NOT NULL AND expires_at < $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(c)| c).collect())
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>> {
        let row: Option<Json<Order>> = sqlx::query_scalar("SELECT doc FROM orders WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|Json(o)| o))
    }

    async fn find_by_order_number(&self, order_number: &str) -> Result<Option<Order>> {
        let row: Option<Json<Order>> = sqlx::query_scalar("SELECT doc FROM orders WHERE order_number = $1").bind(order_number).fetch_optional(&self.pool).await?;
        Ok(row.map(|Json(o)| o))
    }

    async fn find_by_customer(&self, customer_id: &str) -> Result<Vec<Order>> {
        let rows: Vec<Json<Order>> = sqlx::query_scalar("SELECT doc FROM orders WHERE customer_id = $1 ORDER BY created_at DESC")
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(o)| o).collect())
    }

    async fn find_stale_pending(&self, cutoff: Duration, now: DateTime<Utc>) -> Result<Vec<Order>> {
        let rows: Vec<Json<Order>> = sqlx::query_scalar("SELECT doc FROM orders WHERE status = 'pending' AND created_at < $1 ORDER BY created_at")
            .bind(now - cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(o)| o).collect())
    }
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        let row: Option<Json<Payment>> = sqlx::query_scalar("SELECT doc FROM payments WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>> {
        let row: Option<Json<Payment>> = sqlx::query_scalar("SELECT doc FROM payments WHERE order_id = $1 ORDER BY created_at DESC LIMIT 1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let row: Option<Json<Payment>> = sqlx::query_scalar("SELECT doc FROM payments WHERE transaction_id = $1")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn find_stale_pending(&self, cutoff: Duration, now: DateTime<Utc>) -> Result<Vec<Payment>> {
        let rows: Vec<Json<Payment>> = sqlx::query_scalar("SELECT doc FROM payments WHERE status = 'pending' AND created_at < $1 ORDER BY created_at")
            .bind(now - cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|Json(p)| p).collect())
    }
}

#[async_trait]
impl ShipmentRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Shipment>> {
        let row: Option<Json<Shipment>> = sqlx::query_scalar("SELECT doc FROM shipments WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|Json(s)| s))
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Shipment>> {
        let row: Option<Json<Shipment>> = sqlx::query_scalar("SELECT doc FROM shipments WHERE order_id = $1 ORDER BY created_at DESC LIMIT 1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(s)| s))
    }

    async fn find_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>> {
        let row: Option<Json<Shipment>> = sqlx::query_scalar("SELECT doc FROM shipments WHERE tracking_number = $1")
            .bind(tracking_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(s)| s))
    }

}

#[async_trait]
impl LedgerRepository for PgStore {
    async fn entries_for_product(&self, product_id: Uuid) -> Result<Vec<StockLedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT id, product_id, kind, quantity_before, quantity_after, quantity_change, reference_id, reason, recorded_at \
             FROM stock_ledger WHERE product_id = $1 ORDER BY seq",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StockLedgerEntry::try_from).collect()
    }
}

#[async_trait]
impl Store for PgStore {
    fn products(&self) -> &dyn ProductRepository { self }
    fn carts(&self) -> &dyn CartRepository { self }
    fn orders(&self) -> &dyn OrderRepository { self }
    fn payments(&self) -> &dyn PaymentRepository { self }
    fn shipments(&self) -> &dyn ShipmentRepository { self }
    fn ledger(&self) -> &dyn LedgerRepository { self }

    async fn create_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            "INSERT INTO products (id, sku, stock_quantity, reorder_point, active, doc, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())",
        )
        .bind(product.id())
        .bind(product.sku().as_str())
        .bind(i64::from(product.stock_quantity()))
        .bind(i64::from(product.reorder_point()))
        .bind(product.is_active())
        .bind(Json(product))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_stock(&self, movements: &[StockMovement]) -> Result<StockBatch> {
        let mut tx = self.pool.begin().await?;
        let batch = apply_in_tx(&mut tx, movements).await?;
        tx.commit().await?;
        Ok(batch)
    }

    async fn commit(&self, work: UnitOfWork<'_>) -> Result<StockBatch> {
        let mut tx = self.pool.begin().await?;
        if let Some(cart) = work.cart.as_deref() { write_cart(&mut tx, cart).await?; }
        if let Some(order) = work.order.as_deref() { write_order(&mut tx, order).await?; }
        if let Some(payment) = work.payment.as_deref() { write_payment(&mut tx, payment).await?; }
        if let Some(shipment) = work.shipment.as_deref() { write_shipment(&mut tx, shipment).await?; }
        let batch = apply_in_tx(&mut tx, &work.movements).await?;
        tx.commit().await?;
        work.advance();
        Ok(batch)
    }
}

/// Explains why a conditional write matched no row.
async fn missed<T: Versioned>(tx: &mut Transaction<'_, Postgres>, table: &str, value: &T) -> CommerceError {
    let stored: std::result::Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(&format!("SELECT version FROM {table} WHERE id = $1"))
        .bind(value.key())
        .fetch_optional(&mut **tx)
        .await;
    match stored {
        Ok(stored) => value.expect_stored(stored.map(version_from_db)).err().unwrap_or_else(|| value.stale()),
        Err(e) => e.into(),
    }
}

fn version_from_db(v: i64) -> u64 { u64::try_from(v).unwrap_or_default() }

fn version_to_db(v: u64) -> i64 { i64::try_from(v).unwrap_or(i64::MAX) }

async fn write_cart(tx: &mut Transaction<'_, Postgres>, cart: &Cart) -> Result<()> {
    let next = cart.next_stored();
    let affected = if cart.version() == 0 {
        sqlx::query("INSERT INTO carts (id, customer_id, expires_at, version, doc, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, NOW())")
            .bind(cart.id())
            .bind(cart.customer_id())
            .bind(cart.expires_at())
            .bind(version_to_db(next.version()))
            .bind(Json(&next))
            .bind(cart.created_at())
            .execute(&mut **tx)
            .await?
    } else {
        sqlx::query("UPDATE carts SET customer_id = $3, expires_at = $4, version = $5, doc = $6, updated_at = NOW() WHERE id = $1 AND version = $2")
            .bind(cart.id())
            .bind(version_to_db(cart.version()))
            .bind(cart.customer_id())
            .bind(cart.expires_at())
            .bind(version_to_db(next.version()))
            .bind(Json(&next))
            .execute(&mut **tx)
            .await?
    };
    if affected.rows_affected() == 0 { return Err(missed(tx, "carts", cart).await); }
    Ok(())
}

async fn write_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<()> {
    let next = order.next_stored();
    let affected = if order.version() == 0 {
        sqlx::query("INSERT INTO orders (id, order_number, customer_id, status, version, doc, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())")
            .bind(order.id())
            .bind(order.order_number().as_str())
            .bind(order.customer_id())
            .bind(order.status().as_str())
            .bind(version_to_db(next.version()))
            .bind(Json(&next))
            .bind(order.created_at())
            .execute(&mut **tx)
            .await?
    } else {
        sqlx::query("UPDATE orders SET status = $3, version = $4, doc = $5, updated_at = NOW() WHERE id = $1 AND version = $2")
            .bind(order.id())
            .bind(version_to_db(order.version()))
            .bind(order.status().as_str())
            .bind(version_to_db(next.version()))
            .bind(Json(&next))
            .execute(&mut **tx)
            .await?
    };
    if affected.rows_affected() == 0 { return Err(missed(tx, "orders", order).await); }
    Ok(())
}

async fn write_payment(tx: &mut Transaction<'_, Postgres>, payment: &Payment) -> Result<()> {
    let next = payment.next_stored();
    let affected = if payment.version() == 0 {
        sqlx::query(
            "INSERT INTO payments (id, order_id, transaction_id, status, version, doc, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())",
        )
        .bind(payment.id())
        .bind(payment.order_id())
        .bind(payment.transaction_id())
        .bind(payment.status().as_str())
        .bind(version_to_db(next.version()))
        .bind(Json(&next))
        .bind(payment.created_at())
        .execute(&mut **tx)
        .await?
    } else {
        sqlx::query(
            "UPDATE payments SET transaction_id = $3, status = $4, version = $5, doc = $6, updated_at = NOW() WHERE id = $1 AND version = $2",
        )
        .bind(payment.id())
        .bind(version_to_db(payment.version()))
        .bind(payment.transaction_id())
        .bind(payment.status().as_str())
        .bind(version_to_db(next.version()))
        .bind(Json(&next))
        .execute(&mut **tx)
        .await?
    };
    if affected.rows_affected() == 0 { return Err(missed(tx, "payments", payment).await); }
    Ok(())
}

async fn write_shipment(tx: &mut Transaction<'_, Postgres>, shipment: &Shipment) -> Result<()> {
    let next = shipment.next_stored();
    let affected = if shipment.version() == 0 {
        sqlx::query(
            "INSERT INTO shipments (id, order_id, tracking_number, status, version, doc, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())",
        )
        .bind(shipment.id())
        .bind(shipment.order_id())
        .bind(shipment.tracking_number())
        .bind(shipment.status().as_str())
        .bind(version_to_db(next.version()))
        .bind(Json(&next))
        .execute(&mut **tx)
        .await?
    } else {
        sqlx::query("UPDATE shipments SET status = $3, version = $4, doc = $5, updated_at = NOW() WHERE id = $1 AND version = $2")
            .bind(shipment.id())
            .bind(version_to_db(shipment.version()))
            .bind(shipment.status().as_str())
            .bind(version_to_db(next.version()))
            .bind(Json(&next))
            .execute(&mut **tx)
            .await?
    };
    if affected.rows_affected() == 0 { return Err(missed(tx, "shipments", shipment).await); }
    Ok(())
}

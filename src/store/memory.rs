//! In-memory store for tests and single-node development.
//!
//! All state sits behind one async mutex, so every stock batch is serialized
//! and applied to staged copies that are only written back when the whole
//! batch succeeded. Version checks run under the same lock before any stock
//! moves.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use crate::domain::aggregates::{Cart, Order, Payment, PaymentStatus, Product, Shipment};
use crate::domain::ledger::StockLedgerEntry;
use crate::domain::value_objects::Sku;
use crate::error::{CommerceError, Result};
use super::{
    CartRepository, LedgerRepository, OrderRepository, PaymentRepository, ProductRepository, ShipmentRepository,
    StockBatch, StockMovement, Store, UnitOfWork, Versioned,
};

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    carts: HashMap<Uuid, Cart>,
    orders: HashMap<Uuid, Order>,
    payments: HashMap<Uuid, Payment>,
    shipments: HashMap<Uuid, Shipment>,
    ledger: Vec<StockLedgerEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

/// Stored copies never carry undelivered events.
fn stored<T: Clone>(value: &T, drain: impl FnOnce(&mut T)) -> T {
    let mut copy = value.clone();
    drain(&mut copy);
    copy
}

fn apply_movements(state: &mut State, movements: &[StockMovement]) -> Result<StockBatch> {
    let mut staged: BTreeMap<Uuid, Product> = BTreeMap::new();
    let mut entries = Vec::with_capacity(movements.len());
    for movement in movements {
        if !staged.contains_key(&movement.product_id) {
            let current = state.products.get(&movement.product_id)
                .ok_or_else(|| CommerceError::not_found("product", movement.product_id))?;
            staged.insert(movement.product_id, current.clone());
        }
        if let Some(product) = staged.get_mut(&movement.product_id) {
            entries.push(movement.apply(product)?);
        }
    }
    for product in staged.values() {
        state.products.insert(product.id(), stored(product, |p| { p.take_events(); }));
    }
    debug!(entries = entries.len(), "ledger entries appended");
    state.ledger.extend(entries.iter().cloned());
    Ok(StockBatch { products: staged.into_values().collect(), entries })
}

#[async_trait]
impl ProductRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Product>> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn find_by_sku(&self, sku: &Sku) -> Result<Option<Product>> {
        Ok(self.state.lock().await.products.values().find(|p| p.sku() == sku).cloned())
    }

    async fn save(&self, product: &Product) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.products.get(&product.id()) {
            Some(current) if current.stock_quantity() != product.stock_quantity() => {
                return Err(CommerceError::Conflict(format!("stock of {} changed concurrently", product.sku())));
            }
            Some(_) => {}
            None => return Err(CommerceError::not_found("product", product.id())),
        }
        state.products.insert(product.id(), stored(product, |p| { p.take_events(); }));
        Ok(())
    }

    async fn find_needing_reorder(&self) -> Result<Vec<Product>> {
        let state = self.state.lock().await;
        let mut found: Vec<Product> = state.products.values().filter(|p| p.needs_reorder()).cloned().collect();
        found.sort_by_key(|p| p.stock_quantity());
        Ok(found)
    }
}

#[async_trait]
impl CartRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Cart>> {
        Ok(self.state.lock().await.carts.get(&id).cloned())
    }

    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<Cart>> {
        let state = self.state.lock().await;
        Ok(state.carts.values().filter(|c| c.customer_id() == Some(customer_id)).max_by_key(|c| c.created_at()).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.state.lock().await.carts.remove(&id);
        Ok(())
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Cart>> {
        Ok(self.state.lock().await.carts.values().filter(|c| c.is_expired(now)).cloned().collect())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn find_by_order_number(&self, order_number: &str) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.values().find(|o| o.order_number().as_str() == order_number).cloned())
    }

    async fn find_by_customer(&self, customer_id: &str) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state.orders.values().filter(|o| o.customer_id() == customer_id).cloned().collect();
        orders.sort_by_key(|o| std::cmp::Reverse(o.created_at()));
        Ok(orders)
    }

    async fn find_stale_pending(&self, cutoff: Duration, now: DateTime<Utc>) -> Result<Vec<Order>> {
        Ok(self.state.lock().await.orders.values().filter(|o| o.is_stale(cutoff, now)).cloned().collect())
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.values().filter(|p| p.order_id() == order_id).max_by_key(|p| p.created_at()).cloned())
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>> {
        Ok(self.state.lock().await.payments.values().find(|p| p.transaction_id() == Some(transaction_id)).cloned())
    }

    async fn find_stale_pending(&self, cutoff: Duration, now: DateTime<Utc>) -> Result<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.values().filter(|p| p.status() == PaymentStatus::Pending && p.is_stale(cutoff, now)).cloned().collect())
    }
}

#[async_trait]
impl ShipmentRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Shipment>> {
        Ok(self.state.lock().await.shipments.get(&id).cloned())
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Shipment>> {
        let state = self.state.lock().await;
        Ok(state.shipments.values().filter(|s| s.order_id() == order_id).max_by_key(|s| s.shipment_date()).cloned())
    }

    async fn find_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>> {
        Ok(self.state.lock().await.shipments.values().find(|s| s.tracking_number() == tracking_number).cloned())
    }

}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn entries_for_product(&self, product_id: Uuid) -> Result<Vec<StockLedgerEntry>> {
        Ok(self.state.lock().await.ledger.iter().filter(|e| e.product_id == product_id).cloned().collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn products(&self) -> &dyn ProductRepository { self }
    fn carts(&self) -> &dyn CartRepository { self }
    fn orders(&self) -> &dyn OrderRepository { self }
    fn payments(&self) -> &dyn PaymentRepository { self }
    fn shipments(&self) -> &dyn ShipmentRepository { self }
    fn ledger(&self) -> &dyn LedgerRepository { self }

    async fn create_product(&self, product: &Product) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.products.contains_key(&product.id()) || state.products.values().any(|p| p.sku() == product.sku()) {
            return Err(CommerceError::Conflict(format!("SKU {} already exists", product.sku())));
        }
        state.products.insert(product.id(), stored(product, |p| { p.take_events(); }));
        Ok(())
    }

    async fn apply_stock(&self, movements: &[StockMovement]) -> Result<StockBatch> {
        let mut state = self.state.lock().await;
        apply_movements(&mut state, movements)
    }

    async fn commit(&self, work: UnitOfWork<'_>) -> Result<StockBatch> {
        let mut state = self.state.lock().await;
        check_unit(&state, &work)?;
        let batch = apply_movements(&mut state, &work.movements)?;
        if let Some(cart) = work.cart.as_deref() { state.carts.insert(cart.id(), cart.next_stored()); }
        if let Some(order) = work.order.as_deref() { state.orders.insert(order.id(), order.next_stored()); }
        if let Some(payment) = work.payment.as_deref() { state.payments.insert(payment.id(), payment.next_stored()); }
        if let Some(shipment) = work.shipment.as_deref() { state.shipments.insert(shipment.id(), shipment.next_stored()); }
        work.advance();
        Ok(batch)
    }
}

/// Versions and unique keys, checked before anything is written.
fn check_unit(state: &State, work: &UnitOfWork<'_>) -> Result<()> {
    if let Some(cart) = work.cart.as_deref() {
        cart.expect_stored(state.carts.get(&cart.id()).map(Cart::version))?;
    }
    if let Some(order) = work.order.as_deref() {
        order.expect_stored(state.orders.get(&order.id()).map(Order::version))?;
        if state.orders.values().any(|o| o.id() != order.id() && o.order_number() == order.order_number()) {
            return Err(CommerceError::Conflict(format!("order {} already exists", order.order_number())));
        }
    }
    if let Some(payment) = work.payment.as_deref() {
        payment.expect_stored(state.payments.get(&payment.id()).map(Payment::version))?;
        if let Some(tx) = payment.transaction_id() {
            if state.payments.values().any(|p| p.id() != payment.id() && p.transaction_id() == Some(tx)) {
                return Err(CommerceError::Conflict(format!("transaction {tx} is already recorded")));
            }
        }
    }
    if let Some(shipment) = work.shipment.as_deref() {
        shipment.expect_stored(state.shipments.get(&shipment.id()).map(Shipment::version))?;
        if state.shipments.values().any(|s| s.id() != shipment.id() && s.tracking_number() == shipment.tracking_number()) {
            return Err(CommerceError::Conflict(format!("tracking number {} is already in use", shipment.tracking_number())));
        }
    }
    Ok(())
}

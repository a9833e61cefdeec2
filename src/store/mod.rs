//! Persistence seam.
//!
//! Plain lookups go through one repository trait per aggregate. Writes go
//! through [`Store`], whose methods are all-or-nothing: every movement in a
//! batch is applied and logged, or none is. Carts, orders, payments and
//! shipments are only written through [`Store::commit`], which checks the
//! version each one was loaded at.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use crate::domain::aggregates::{Cart, Order, Payment, Product, Shipment};
use crate::domain::ledger::StockLedgerEntry;
use crate::domain::value_objects::Sku;
use crate::error::{CommerceError, Result};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Product>>;
    async fn find_by_sku(&self, sku: &Sku) -> Result<Option<Product>>;
    /// Catalog fields only. Rejected with `Conflict` if the stored stock
    /// quantity no longer matches the one on `product`.
    async fn save(&self, product: &Product) -> Result<()>;
    async fn find_needing_reorder(&self) -> Result<Vec<Product>>;
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Cart>>;
    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<Cart>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Cart>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>>;
    async fn find_by_order_number(&self, order_number: &str) -> Result<Option<Order>>;
    async fn find_by_customer(&self, customer_id: &str) -> Result<Vec<Order>>;
    async fn find_stale_pending(&self, cutoff: Duration, now: DateTime<Utc>) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>>;
    /// Most recent payment for the order.
    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>>;
    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>>;
    async fn find_stale_pending(&self, cutoff: Duration, now: DateTime<Utc>) -> Result<Vec<Payment>>;
}

#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Shipment>>;
    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Shipment>>;
    async fn find_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>>;
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Entries for one product, in append order.
    async fn entries_for_product(&self, product_id: Uuid) -> Result<Vec<StockLedgerEntry>>;
}

#[async_trait]
pub trait Store: Send + Sync {
    fn products(&self) -> &dyn ProductRepository;
    fn carts(&self) -> &dyn CartRepository;
    fn orders(&self) -> &dyn OrderRepository;
    fn payments(&self) -> &dyn PaymentRepository;
    fn shipments(&self) -> &dyn ShipmentRepository;
    fn ledger(&self) -> &dyn LedgerRepository;

    /// Inserts a new product. Fails with `Conflict` on a duplicate SKU.
    async fn create_product(&self, product: &Product) -> Result<()>;

    /// Applies every movement or none of them.
    async fn apply_stock(&self, movements: &[StockMovement]) -> Result<StockBatch>;

    /// Writes everything in `work` or nothing. Fails with `Conflict` when any
    /// aggregate was written by someone else since it was loaded, or when a
    /// new one collides with a unique key (order number, transaction id,
    /// tracking number). On success each aggregate's version is advanced.
    async fn commit(&self, work: UnitOfWork<'_>) -> Result<StockBatch>;
}

/// Aggregates and stock movements that are persisted together.
///
/// An aggregate at version 0 is inserted; any other version must match the
/// stored one exactly.
#[derive(Default)]
pub struct UnitOfWork<'a> {
    cart: Option<&'a mut Cart>,
    order: Option<&'a mut Order>,
    payment: Option<&'a mut Payment>,
    shipment: Option<&'a mut Shipment>,
    movements: Vec<StockMovement>,
}

impl<'a> UnitOfWork<'a> {
    pub fn new() -> Self { Self::default() }

    pub fn cart(mut self, cart: impl Into<Option<&'a mut Cart>>) -> Self {
        if let Some(cart) = cart.into() { self.cart = Some(cart); }
        self
    }

    pub fn order(mut self, order: impl Into<Option<&'a mut Order>>) -> Self {
        if let Some(order) = order.into() { self.order = Some(order); }
        self
    }

    pub fn payment(mut self, payment: impl Into<Option<&'a mut Payment>>) -> Self {
        if let Some(payment) = payment.into() { self.payment = Some(payment); }
        self
    }

    pub fn shipment(mut self, shipment: impl Into<Option<&'a mut Shipment>>) -> Self {
        if let Some(shipment) = shipment.into() { self.shipment = Some(shipment); }
        self
    }

    pub fn movements(mut self, movements: impl IntoIterator<Item = StockMovement>) -> Self {
        self.movements.extend(movements);
        self
    }

    /// Called by a store once the write is durable.
    fn advance(self) {
        if let Some(cart) = self.cart { cart.set_version(cart.version() + 1); }
        if let Some(order) = self.order { order.set_version(order.version() + 1); }
        if let Some(payment) = self.payment { payment.set_version(payment.version() + 1); }
        if let Some(shipment) = self.shipment { shipment.set_version(shipment.version() + 1); }
    }
}

/// Optimistic concurrency token shared by the aggregates a [`UnitOfWork`]
/// carries.
pub(crate) trait Versioned: Clone {
    const KIND: &'static str;

    fn key(&self) -> Uuid;
    fn current_version(&self) -> u64;
    fn store_version(&mut self, version: u64);
    fn drain_events(&mut self) {}

    /// What storage holds after a successful write: next version, no
    /// undelivered events.
    fn next_stored(&self) -> Self {
        let mut copy = self.clone();
        copy.drain_events();
        copy.store_version(self.current_version() + 1);
        copy
    }

    /// `stored` is the version currently persisted, `None` if absent.
    fn expect_stored(&self, stored: Option<u64>) -> Result<()> {
        match (stored, self.current_version()) {
            (None, 0) => Ok(()),
            (Some(v), expected) if v == expected => Ok(()),
            (Some(_), 0) => Err(CommerceError::Conflict(format!("{} {} already exists", Self::KIND, self.key()))),
            (None, _) => Err(CommerceError::not_found(Self::KIND, self.key())),
            (Some(_), _) => Err(self.stale()),
        }
    }

    fn stale(&self) -> CommerceError {
        CommerceError::Conflict(format!("{} {} was changed concurrently, reload and retry", Self::KIND, self.key()))
    }
}

impl Versioned for Cart {
    const KIND: &'static str = "cart";
    fn key(&self) -> Uuid { self.id() }
    fn current_version(&self) -> u64 { self.version() }
    fn store_version(&mut self, version: u64) { self.set_version(version); }
}

impl Versioned for Order {
    const KIND: &'static str = "order";
    fn key(&self) -> Uuid { self.id() }
    fn current_version(&self) -> u64 { self.version() }
    fn store_version(&mut self, version: u64) { self.set_version(version); }
    fn drain_events(&mut self) { self.take_events(); }
}

impl Versioned for Payment {
    const KIND: &'static str = "payment";
    fn key(&self) -> Uuid { self.id() }
    fn current_version(&self) -> u64 { self.version() }
    fn store_version(&mut self, version: u64) { self.set_version(version); }
    fn drain_events(&mut self) { self.take_events(); }
}

impl Versioned for Shipment {
    const KIND: &'static str = "shipment";
    fn key(&self) -> Uuid { self.id() }
    fn current_version(&self) -> u64 { self.version() }
    fn store_version(&mut self, version: u64) { self.set_version(version); }
    fn drain_events(&mut self) { self.take_events(); }
}

/// Products touched by a stock batch (with their pending events) and the
/// ledger entries appended for it.
#[derive(Debug, Default)]
pub struct StockBatch {
    pub products: Vec<Product>,
    pub entries: Vec<StockLedgerEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MovementKind {
    Receive(u32),
    Remove(u32),
    Reserve(u32),
    Release(u32),
    Adjust(i64),
    Count(u32),
}

/// A requested stock change, applied by the store under lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockMovement {
    pub product_id: Uuid,
    pub kind: MovementKind,
    pub reference: Option<String>,
    pub reason: Option<String>,
}

impl StockMovement {
    pub fn new(product_id: Uuid, kind: MovementKind) -> Self { Self { product_id, kind, reference: None, reason: None } }
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self { self.reference = Some(reference.into()); self }
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self { self.reason = Some(reason.into()); self }

    pub fn apply(&self, product: &mut Product) -> Result<StockLedgerEntry> {
        if product.id() != self.product_id { return Err(CommerceError::not_found("product", self.product_id)); }
        let reference = self.reference.as_deref();
        match self.kind {
            MovementKind::Receive(qty) => product.increase_stock(qty, reference),
            MovementKind::Remove(qty) => product.decrease_stock(qty, reference),
            MovementKind::Reserve(qty) => product.reserve_stock(qty, reference.unwrap_or_default()),
            MovementKind::Release(qty) => product.release_stock(qty, reference.unwrap_or_default()),
            MovementKind::Adjust(delta) => product.adjust_stock(delta, self.reason.as_deref().unwrap_or_default()),
            MovementKind::Count(counted) => Ok(product.count_stock(counted, reference)),
        }
    }

    /// One debit per order line.
    pub fn reservations(order: &Order) -> Vec<StockMovement> {
        Self::per_line(order, MovementKind::Reserve)
    }

    /// Compensating credit for each earlier reservation.
    pub fn releases(order: &Order) -> Vec<StockMovement> {
        Self::per_line(order, MovementKind::Release)
    }

    /// Restock for whatever came back from the customer.
    pub fn returns(order: &Order) -> Vec<StockMovement> {
        order.items().iter()
            .filter(|i| i.returned_quantity() > 0)
            .map(|i| StockMovement::new(i.product_id(), MovementKind::Receive(i.returned_quantity()))
                .with_reference(order.order_number().as_str())
                .with_reason("customer return"))
            .collect()
    }

    fn per_line(order: &Order, kind: impl Fn(u32) -> MovementKind) -> Vec<StockMovement> {
        order.items().iter()
            .map(|i| StockMovement::new(i.product_id(), kind(i.quantity())).with_reference(order.order_number().as_str()))
            .collect()
    }
}

/// Product ids of a batch, deduplicated and sorted so concurrent batches
/// always lock in the same order.
pub fn lock_order(movements: &[StockMovement]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = movements.iter().map(|m| m.product_id).collect();
    ids.sort();
    ids.dedup();
    ids
}

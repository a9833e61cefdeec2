//! Commerce service: the operations surrounding layers call.
//!
//! Each operation loads what it needs, applies the domain change, persists
//! every touched aggregate and stock movement in one [`UnitOfWork`] and only
//! then hands the raised events to the notifier. A unit built from stale
//! reads is rejected with `Conflict` and nothing in it is written.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;
use crate::config::{CoreConfig, PaymentFailurePolicy};
use crate::domain::aggregates::{
    Cart, CartItem, ExceptionType, Order, OrderStatus, Payment, PaymentMethod, PaymentStatus, Product, Shipment,
    ShipmentStatus, TransitionPolicy,
};
use crate::domain::checkout::{build_order, ShippingInfo};
use crate::domain::events::DomainEvent;
use crate::domain::ledger::{reconcile, LedgerDrift, StockLedgerEntry};
use crate::domain::value_objects::{Money, Sku};
use crate::error::{CommerceError, InvalidTransition, PaymentError, PaymentErrorKind, Result, ShippingError, ShippingErrorKind};
use crate::notify::{dispatch, Notifier};
use crate::store::{MovementKind, StockBatch, StockMovement, Store, UnitOfWork};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewProduct {
    #[validate(length(min = 1, max = 50, message = "sku is required"))]
    pub sku: String,
    #[validate(length(min = 1, max = 200, message = "name is required"))]
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub sale_price: Option<Decimal>,
    #[serde(default)]
    pub reorder_point: u32,
    #[serde(default)]
    pub initial_stock: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingUpdate {
    pub status: ShipmentStatus,
    pub location: Option<String>,
    #[serde(default)]
    pub description: String,
    pub exception_type: Option<ExceptionType>,
}

#[derive(Clone)]
pub struct CommerceService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    config: Arc<CoreConfig>,
}

impl CommerceService {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, config: Arc<CoreConfig>) -> Self {
        Self { store, notifier, config }
    }

    pub fn config(&self) -> &CoreConfig { &self.config }
    pub fn store(&self) -> &dyn Store { self.store.as_ref() }

    fn policy(&self) -> TransitionPolicy { self.config.transition_policy }

    async fn publish(&self, events: Vec<DomainEvent>) { dispatch(self.notifier.as_ref(), events).await; }

    fn stock_events(batch: StockBatch) -> Vec<DomainEvent> {
        batch.products.into_iter().flat_map(|mut p| p.take_events()).collect()
    }

    pub async fn get_product(&self, id: Uuid) -> Result<Product> {
        self.store.products().find_by_id(id).await?.ok_or_else(|| CommerceError::not_found("product", id))
    }

    #[instrument(skip(self, new), fields(sku = %new.sku))]
    pub async fn create_product(&self, new: NewProduct) -> Result<Product> {
        new.validate()?;
        let sku = Sku::new(new.sku.as_str()).map_err(|e| CommerceError::invalid("sku", e.to_string()))?;
        if new.price.is_sign_negative() { return Err(CommerceError::invalid("price", "price must not be negative")); }
        let currency = self.config.currency.as_str();
        let mut product = Product::create(sku, new.name, Money::new(new.price, currency))
            .with_description(new.description.unwrap_or_default())
            .with_reorder_point(new.reorder_point);
        product.set_sale_price(new.sale_price.map(|s| Money::new(s, currency)));
        product.publish()?;
        self.store.create_product(&product).await?;
        info!(product_id = %product.id(), "product created");
        self.publish(product.take_events()).await;
        if new.initial_stock == 0 { return Ok(product); }
        self.restock(product.id(), new.initial_stock, Some("initial stock".into())).await
    }

    #[instrument(skip(self))]
    pub async fn deactivate_product(&self, product_id: Uuid) -> Result<Product> {
        let mut product = self.get_product(product_id).await?;
        product.deactivate();
        self.store.products().save(&product).await?;
        self.publish(product.take_events()).await;
        Ok(product)
    }

    /// Stock-in for received goods.
    #[instrument(skip(self))]
    pub async fn restock(&self, product_id: Uuid, qty: u32, reference: Option<String>) -> Result<Product> {
        let mut movement = StockMovement::new(product_id, MovementKind::Receive(qty));
        if let Some(reference) = reference { movement = movement.with_reference(reference); }
        self.move_stock(movement).await
    }

    /// Stock-out outside of an order (damage, write-off, manual pick).
    #[instrument(skip(self))]
    pub async fn remove_stock(&self, product_id: Uuid, qty: u32, reference: Option<String>) -> Result<Product> {
        let mut movement = StockMovement::new(product_id, MovementKind::Remove(qty));
        if let Some(reference) = reference { movement = movement.with_reference(reference); }
        self.move_stock(movement).await
    }

    #[instrument(skip(self))]
    pub async fn adjust_stock(&self, product_id: Uuid, delta: i64, reason: &str) -> Result<Product> {
        self.move_stock(StockMovement::new(product_id, MovementKind::Adjust(delta)).with_reason(reason)).await
    }

    #[instrument(skip(self))]
    pub async fn cycle_count(&self, product_id: Uuid, counted: u32, reference: Option<String>) -> Result<Product> {
        let mut movement = StockMovement::new(product_id, MovementKind::Count(counted));
        if let Some(reference) = reference { movement = movement.with_reference(reference); }
        self.move_stock(movement).await
    }

    async fn move_stock(&self, movement: StockMovement) -> Result<Product> {
        let product_id = movement.product_id;
        let batch = self.store.apply_stock(&[movement]).await?;
        let mut product = batch.products.into_iter().next().ok_or_else(|| CommerceError::not_found("product", product_id))?;
        info!(product_id = %product_id, stock = product.stock_quantity(), "stock updated");
        self.publish(product.take_events()).await;
        Ok(product)
    }

    pub async fn stock_history(&self, product_id: Uuid) -> Result<Vec<StockLedgerEntry>> {
        self.get_product(product_id).await?;
        self.store.ledger().entries_for_product(product_id).await
    }

    /// `None` when the ledger and the cached counter agree.
    pub async fn reconcile_stock(&self, product_id: Uuid) -> Result<Option<LedgerDrift>> {
        let product = self.get_product(product_id).await?;
        let entries = self.store.ledger().entries_for_product(product_id).await?;
        let drift = reconcile(product.stock_quantity(), &entries).err();
        if let Some(drift) = &drift { warn!(%product_id, %drift, "stock ledger drift"); }
        Ok(drift)
    }

    pub async fn products_needing_reorder(&self) -> Result<Vec<Product>> {
        self.store.products().find_needing_reorder().await
    }

    pub async fn get_cart(&self, id: Uuid) -> Result<Cart> {
        self.store.carts().find_by_id(id).await?.ok_or_else(|| CommerceError::not_found("cart", id))
    }

    pub async fn create_cart(&self, customer_id: Option<String>, session_id: Option<String>) -> Result<Cart> {
        let currency = self.config.currency.as_str();
        let mut cart = match (customer_id, session_id) {
            (Some(customer), _) => Cart::for_customer(customer, currency),
            (None, Some(session)) => Cart::for_session(session, currency),
            (None, None) => Cart::new(currency),
        }
        .with_ttl_days(self.config.cart_ttl_days);
        self.store.commit(UnitOfWork::new().cart(&mut cart)).await?;
        Ok(cart)
    }

    #[instrument(skip(self))]
    pub async fn add_to_cart(&self, cart_id: Uuid, product_id: Uuid, qty: u32) -> Result<Cart> {
        let mut cart = self.open_cart(cart_id).await?;
        let product = self.get_product(product_id).await?;
        if !product.is_active() { return Err(CommerceError::invalid("product_id", format!("{} is not available", product.name()))); }
        let wanted = cart.find_item(product_id).map_or(0, |i| i.quantity).saturating_add(qty);
        ensure_available(&product, wanted)?;
        cart.add_item(CartItem::from_product(&product, qty))?;
        self.store.commit(UnitOfWork::new().cart(&mut cart)).await?;
        Ok(cart)
    }

    /// A quantity of zero removes the item.
    pub async fn update_cart_item(&self, cart_id: Uuid, product_id: Uuid, qty: u32) -> Result<Cart> {
        let mut cart = self.open_cart(cart_id).await?;
        if qty > 0 { ensure_available(&self.get_product(product_id).await?, qty)?; }
        cart.update_quantity(product_id, qty)?;
        self.store.commit(UnitOfWork::new().cart(&mut cart)).await?;
        Ok(cart)
    }

    pub async fn remove_from_cart(&self, cart_id: Uuid, product_id: Uuid) -> Result<Cart> {
        let mut cart = self.open_cart(cart_id).await?;
        cart.remove_item(product_id)?;
        self.store.commit(UnitOfWork::new().cart(&mut cart)).await?;
        Ok(cart)
    }

    pub async fn apply_coupon(&self, cart_id: Uuid, code: &str, discount: Decimal) -> Result<Cart> {
        let mut cart = self.open_cart(cart_id).await?;
        let discount = Money::new(discount, cart.currency());
        cart.apply_coupon(code, discount)?;
        self.store.commit(UnitOfWork::new().cart(&mut cart)).await?;
        Ok(cart)
    }

    pub async fn save_cart_for_later(&self, cart_id: Uuid) -> Result<Cart> {
        let mut cart = self.get_cart(cart_id).await?;
        cart.save_for_later();
        self.store.commit(UnitOfWork::new().cart(&mut cart)).await?;
        Ok(cart)
    }

    pub async fn expired_carts(&self, now: DateTime<Utc>) -> Result<Vec<Cart>> {
        self.store.carts().find_expired(now).await
    }

    async fn open_cart(&self, cart_id: Uuid) -> Result<Cart> {
        let cart = self.get_cart(cart_id).await?;
        if cart.is_expired(Utc::now()) { return Err(CommerceError::invalid("cart", "cart has expired")); }
        Ok(cart)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Order> {
        self.store.orders().find_by_id(id).await?.ok_or_else(|| CommerceError::not_found("order", id))
    }

    pub async fn find_order_by_number(&self, order_number: &str) -> Result<Order> {
        self.store.orders().find_by_order_number(order_number).await?.ok_or_else(|| CommerceError::not_found("order", order_number))
    }

    pub async fn orders_for_customer(&self, customer_id: &str) -> Result<Vec<Order>> {
        self.store.orders().find_by_customer(customer_id).await
    }

    /// Freezes the cart into an order, debits stock for every line and clears
    /// the cart in one unit of work. Any shortage aborts the whole checkout.
    #[instrument(skip(self, info), fields(customer_id = %info.customer_id))]
    pub async fn create_order_from_cart(&self, cart_id: Uuid, info: ShippingInfo) -> Result<Order> {
        let mut cart = self.get_cart(cart_id).await?;
        let mut products = HashMap::with_capacity(cart.item_count());
        for item in cart.items() {
            let product = self.get_product(item.product_id).await?;
            products.insert(product.id(), product);
        }
        let mut order = build_order(&cart, &products, &info, &self.config.pricing, Utc::now())?;
        order.mark_placed();
        cart.clear();
        // The cart rides along at the version it was read at, so a second
        // submit of the same cart loses.
        let reservations = StockMovement::reservations(&order);
        let batch = self.store.commit(UnitOfWork::new().cart(&mut cart).order(&mut order).movements(reservations)).await?;
        info!(order_number = %order.order_number(), total = %order.total(), "order placed");

        let mut events = order.take_events();
        events.extend(Self::stock_events(batch));
        self.publish(events).await;
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn mark_processing(&self, order_id: Uuid) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        if self.policy().resolve(order.mark_as_processing())? {
            self.store.commit(UnitOfWork::new().order(&mut order)).await?;
            info!(order_number = %order.order_number(), "order processing");
            self.publish(order.take_events()).await;
        }
        Ok(order)
    }

    /// Cancels before shipment. Releasing the reserved stock and refunding
    /// or cancelling the payment are written together with the order.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        if !self.policy().resolve(order.cancel(reason))? { return Ok(order); }
        let releases = release_reserved(&mut order);
        let mut payment = match self.store.payments().find_by_order(order.id()).await? {
            Some(mut payment) => settle_for_cancel(&mut payment, reason)?.then_some(payment),
            None => None,
        };
        let batch = self.store.commit(UnitOfWork::new().order(&mut order).payment(payment.as_mut()).movements(releases)).await?;
        info!(order_number = %order.order_number(), reason, payment_settled = payment.is_some(), "order cancelled");

        let mut events = order.take_events();
        if let Some(payment) = payment.as_mut() { events.extend(payment.take_events()); }
        events.extend(Self::stock_events(batch));
        self.publish(events).await;
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn hold_order(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        if self.policy().resolve(order.place_on_hold(reason))? {
            self.store.commit(UnitOfWork::new().order(&mut order)).await?;
            info!(order_number = %order.order_number(), reason, "order on hold");
            self.publish(order.take_events()).await;
        }
        Ok(order)
    }

    /// Takes an order out of a holding state. Stock released while it was
    /// held is reserved again, which fails if it has been sold meanwhile.
    #[instrument(skip(self))]
    pub async fn resume_order(&self, order_id: Uuid) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        if !self.policy().resolve(order.resume())? { return Ok(order); }
        let movements = if order.stock_reserved() {
            vec![]
        } else {
            let movements = StockMovement::reservations(&order);
            order.mark_stock_reserved();
            movements
        };
        let batch = self.store.commit(UnitOfWork::new().order(&mut order).movements(movements)).await?;
        info!(order_number = %order.order_number(), status = order.status().as_str(), "order resumed");
        let mut events = order.take_events();
        events.extend(Self::stock_events(batch));
        self.publish(events).await;
        Ok(order)
    }

    /// Delivered goods came back; they go back into stock.
    #[instrument(skip(self))]
    pub async fn return_order(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        if !self.policy().resolve(order.mark_as_returned(reason))? { return Ok(order); }
        let returns = StockMovement::returns(&order);
        let batch = self.store.commit(UnitOfWork::new().order(&mut order).movements(returns)).await?;
        info!(order_number = %order.order_number(), reason, "order returned");
        let mut events = order.take_events();
        events.extend(Self::stock_events(batch));
        self.publish(events).await;
        Ok(order)
    }

    pub async fn stale_pending_orders(&self, now: DateTime<Utc>) -> Result<Vec<Order>> {
        self.store.orders().find_stale_pending(self.config.pending_cutoff, now).await
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Payment> {
        self.store.payments().find_by_id(id).await?.ok_or_else(|| CommerceError::not_found("payment", id))
    }

    pub async fn payment_for_order(&self, order_id: Uuid) -> Result<Payment> {
        self.store.payments().find_by_order(order_id).await?.ok_or_else(|| CommerceError::not_found("payment", order_id))
    }

    /// Opens a payment for the full order total.
    #[instrument(skip(self))]
    pub async fn record_payment(&self, order_id: Uuid, method: PaymentMethod, amount: Decimal) -> Result<Payment> {
        let mut order = self.get_order(order_id).await?;
        if order.status() != OrderStatus::Pending {
            return Err(CommerceError::InvalidOrderStatusTransition(InvalidTransition::new(order.status(), OrderStatus::Paid)));
        }
        let amount = Money::new(amount, order.currency());
        if amount != *order.total() {
            return Err(CommerceError::invalid("amount", format!("payment must cover the order total of {}", order.total())));
        }
        if let Some(existing) = self.store.payments().find_by_order(order_id).await? {
            if existing.status() != PaymentStatus::Cancelled && !existing.is_exhausted() {
                return Err(CommerceError::Conflict(format!("order {} already has payment {}", order.order_number(), existing.id())));
            }
        }
        let mut payment = Payment::new(order_id, method, amount)?.with_max_retries(self.config.max_payment_retries);
        // Writing the unchanged order as well serializes attempts to open a
        // payment for it.
        self.store.commit(UnitOfWork::new().order(&mut order).payment(&mut payment)).await?;
        info!(payment_id = %payment.id(), order_number = %order.order_number(), "payment recorded");
        Ok(payment)
    }

    /// Completes the payment and marks the order paid, both in one write.
    /// Repeating the call with the same transaction id changes nothing,
    /// except that an order still pending behind a completed payment is
    /// marked paid.
    #[instrument(skip(self, authorization_code))]
    pub async fn complete_payment(&self, payment_id: Uuid, transaction_id: &str, authorization_code: Option<String>) -> Result<Order> {
        let mut payment = self.get_payment(payment_id).await?;
        if let Some(other) = self.store.payments().find_by_transaction_id(transaction_id.trim()).await? {
            if other.id() != payment.id() {
                return Err(PaymentError::with_detail(PaymentErrorKind::DuplicateTransaction, transaction_id).into());
            }
        }
        let applied = payment.mark_as_completed(transaction_id, authorization_code.as_deref())?;
        let mut order = self.get_order(payment.order_id()).await?;
        let paid = if applied || (order.status() == OrderStatus::Pending && payment.status() == PaymentStatus::Completed) {
            self.policy().resolve(order.mark_as_paid(payment.id()))?
        } else {
            false
        };
        if !applied && !paid { return Ok(order); }

        self.store.commit(UnitOfWork::new().payment(applied.then_some(&mut payment)).order(paid.then_some(&mut order))).await?;
        let mut events = payment.take_events();
        if paid {
            info!(order_number = %order.order_number(), "order paid");
            events.extend(order.take_events());
        } else {
            warn!(order_number = %order.order_number(), status = order.status().as_str(), "payment completed for an order that is not pending");
        }
        self.publish(events).await;
        Ok(order)
    }

    /// Records a failed attempt. Once no attempts are left the configured
    /// [`PaymentFailurePolicy`] decides what happens to the order, which is
    /// written together with the payment.
    #[instrument(skip(self))]
    pub async fn fail_payment(&self, payment_id: Uuid, reason: &str) -> Result<Payment> {
        let mut payment = self.get_payment(payment_id).await?;
        payment.mark_as_failed(reason)?;
        let (mut order, releases) = if payment.can_retry() {
            (None, vec![])
        } else {
            self.after_final_failure(payment.order_id()).await?
        };
        let batch = self.store.commit(UnitOfWork::new().payment(&mut payment).order(order.as_mut()).movements(releases)).await?;
        warn!(retry_count = payment.retry_count(), can_retry = payment.can_retry(), "payment failed");

        let mut events = payment.take_events();
        if let Some(order) = order.as_mut() { events.extend(order.take_events()); }
        events.extend(Self::stock_events(batch));
        self.publish(events).await;
        Ok(payment)
    }

    async fn after_final_failure(&self, order_id: Uuid) -> Result<(Option<Order>, Vec<StockMovement>)> {
        let mut order = self.get_order(order_id).await?;
        let applied = match self.config.payment_failure_policy {
            PaymentFailurePolicy::LeavePending => {
                info!(order_number = %order.order_number(), "payment attempts exhausted, order left pending");
                return Ok((None, vec![]));
            }
            PaymentFailurePolicy::HoldOrder => self.policy().resolve(order.mark_payment_failed())?,
            PaymentFailurePolicy::CancelOrder => self.policy().resolve(order.cancel("payment failed"))?,
        };
        if !applied { return Ok((None, vec![])); }
        info!(order_number = %order.order_number(), status = order.status().as_str(), "payment attempts exhausted");
        let releases = release_reserved(&mut order);
        Ok((Some(order), releases))
    }

    #[instrument(skip(self))]
    pub async fn retry_payment(&self, payment_id: Uuid) -> Result<Payment> {
        let mut payment = self.get_payment(payment_id).await?;
        payment.retry()?;
        self.store.commit(UnitOfWork::new().payment(&mut payment)).await?;
        Ok(payment)
    }

    /// Refunds part or all of a completed payment. A full refund of a
    /// returned order closes it as refunded.
    #[instrument(skip(self))]
    pub async fn refund_payment(&self, payment_id: Uuid, amount: Decimal, reason: &str) -> Result<Payment> {
        let mut payment = self.get_payment(payment_id).await?;
        let amount = Money::new(amount, payment.amount().currency());
        payment.process_refund(&amount, reason)?;
        let mut order = None;
        if payment.status() == PaymentStatus::Refunded {
            let mut returned = self.get_order(payment.order_id()).await?;
            if returned.status() == OrderStatus::Returned && self.policy().resolve(returned.mark_as_refunded())? {
                order = Some(returned);
            }
        }
        self.store.commit(UnitOfWork::new().payment(&mut payment).order(order.as_mut())).await?;
        info!(refunded = %payment.refund_amount(), partial = payment.is_partial_refund(), "payment refunded");

        let mut events = payment.take_events();
        if let Some(order) = order.as_mut() { events.extend(order.take_events()); }
        self.publish(events).await;
        Ok(payment)
    }

    #[instrument(skip(self))]
    pub async fn cancel_payment(&self, payment_id: Uuid, reason: &str) -> Result<Payment> {
        let mut payment = self.get_payment(payment_id).await?;
        if payment.cancel_payment(reason)? {
            self.store.commit(UnitOfWork::new().payment(&mut payment)).await?;
            self.publish(payment.take_events()).await;
        }
        Ok(payment)
    }

    pub async fn stale_pending_payments(&self, now: DateTime<Utc>) -> Result<Vec<Payment>> {
        self.store.payments().find_stale_pending(self.config.pending_cutoff, now).await
    }

    pub async fn get_shipment(&self, id: Uuid) -> Result<Shipment> {
        self.store.shipments().find_by_id(id).await?.ok_or_else(|| CommerceError::not_found("shipment", id))
    }

    pub async fn shipment_for_order(&self, order_id: Uuid) -> Result<Shipment> {
        self.store.shipments().find_by_order(order_id).await?.ok_or_else(|| CommerceError::not_found("shipment", order_id))
    }

    /// Creates the shipment and moves the order to `Shipped` in one write, so
    /// a cancellation racing it cannot both succeed. Shipping an already
    /// shipped order returns its existing shipment.
    #[instrument(skip(self))]
    pub async fn ship_order(&self, order_id: Uuid, carrier: &str, tracking_number: &str) -> Result<Shipment> {
        let mut order = self.get_order(order_id).await?;
        if let Some(existing) = order.shipment_id() { return self.get_shipment(existing).await; }
        if !matches!(order.status(), OrderStatus::Paid | OrderStatus::Processing) {
            return Err(CommerceError::InvalidOrderStatusTransition(InvalidTransition::new(order.status(), OrderStatus::Shipped)));
        }
        if self.store.shipments().find_by_tracking_number(tracking_number.trim()).await?.is_some() {
            return Err(ShippingError::with_detail(ShippingErrorKind::DuplicateTrackingNumber, tracking_number).into());
        }

        let eta = Shipment::estimate_from(Utc::now(), self.config.default_transit_days);
        let mut shipment = Shipment::create(order.id(), carrier, tracking_number, order.shipping_address().clone(), Some(eta))?;
        shipment.ship();
        order.mark_as_shipped(shipment.id()).map_err(CommerceError::InvalidOrderStatusTransition)?;
        self.store.commit(UnitOfWork::new().shipment(&mut shipment).order(&mut order)).await?;
        info!(order_number = %order.order_number(), carrier, tracking_number, "order shipped");

        let mut events = shipment.take_events();
        events.extend(order.take_events());
        self.publish(events).await;
        Ok(shipment)
    }

    /// Appends a carrier update. The first delivery report also marks the
    /// order delivered.
    #[instrument(skip(self, update), fields(status = update.status.as_str()))]
    pub async fn record_tracking_event(&self, shipment_id: Uuid, update: TrackingUpdate) -> Result<Shipment> {
        let mut shipment = self.get_shipment(shipment_id).await?;
        let first_delivery = shipment.add_tracking_update(update.status, update.location, &update.description, update.exception_type)?;
        let mut delivered_order = None;
        if first_delivery {
            let mut order = self.get_order(shipment.order_id()).await?;
            if self.policy().resolve(order.mark_as_delivered())? { delivered_order = Some(order); }
        }
        self.store.commit(UnitOfWork::new().shipment(&mut shipment).order(delivered_order.as_mut())).await?;
        let mut events = shipment.take_events();
        if let Some(order) = delivered_order.as_mut() {
            info!(order_number = %order.order_number(), "order delivered");
            events.extend(order.take_events());
        }
        self.publish(events).await;
        Ok(shipment)
    }
}

/// Movements handing back a reserved checkout debit, if one is held.
fn release_reserved(order: &mut Order) -> Vec<StockMovement> {
    if !order.stock_reserved() { return vec![]; }
    let releases = StockMovement::releases(order);
    order.mark_stock_released();
    releases
}

/// Refunds a captured payment in full, or cancels one not yet captured.
/// `false` when there is nothing to do.
fn settle_for_cancel(payment: &mut Payment, reason: &str) -> Result<bool> {
    if payment.status().is_refundable() {
        let refund = payment.refundable_amount();
        payment.process_refund(&refund, &format!("Order cancelled: {reason}"))?;
        return Ok(true);
    }
    if payment.status().is_captured() { return Ok(false); }
    Ok(payment.cancel_payment(reason)?)
}

fn ensure_available(product: &Product, wanted: u32) -> Result<()> {
    if product.has_enough_stock(wanted) { return Ok(()); }
    Err(CommerceError::InsufficientStock {
        product_id: product.id(),
        product_name: product.name().to_string(),
        requested: wanted,
        available: product.stock_quantity(),
    })
}

//! Order Aggregate
//!
//! An order is created once, from a cart, and from then on only moves through
//! its status machine:
//!
//! ```text
//! Pending -> Paid -> Processing -> Shipped -> Delivered -> Returned -> Refunded
//!    |        |          |
//!    +--------+----------+--> Cancelled
//!    |        |
//!    +--------+--> OnHold / PaymentFailed --> Pending | Processing
//! ```
//!
//! Transition methods return `Err(InvalidTransition)` when their precondition
//! does not hold and leave the order untouched; [`TransitionPolicy`] decides
//! whether callers see that as a silent no-op or as an error.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use crate::domain::events::{DomainEvent, OrderEvent};
use crate::domain::value_objects::{Address, Money, OrderNumber, Sku};
use crate::error::{CommerceError, InvalidTransition, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    id: Uuid,
    order_number: OrderNumber,
    customer_id: String,
    email: String,
    status: OrderStatus,
    currency: String,
    items: Vec<OrderLineItem>,
    subtotal: Money,
    tax: Money,
    shipping: Money,
    discount: Money,
    total: Money,
    coupon_code: Option<String>,
    shipping_address: Address,
    billing_address: Address,
    payment_id: Option<Uuid>,
    shipment_id: Option<Uuid>,
    /// Whether the checkout debit is currently held against the ledger.
    stock_reserved: bool,
    customer_notes: Option<String>,
    internal_notes: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    returned_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful write.
    #[serde(default)]
    version: u64,
    #[serde(skip)]
    events: Vec<DomainEvent>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Paid,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Returned,
    Refunded,
    PaymentFailed,
    OnHold,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
            OrderStatus::Refunded => "refunded",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::OnHold => "on_hold",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Paid => "Paid",
            OrderStatus::Processing => "Processing",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Returned => "Returned",
            OrderStatus::Refunded => "Refunded",
            OrderStatus::PaymentFailed => "Payment Failed",
            OrderStatus::OnHold => "On Hold",
        }
    }

    pub fn next_possible_statuses(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[Paid, PaymentFailed, OnHold, Cancelled],
            Paid => &[Processing, Shipped, PaymentFailed, OnHold, Cancelled],
            Processing => &[Shipped, Cancelled],
            Shipped => &[Delivered],
            Delivered => &[Returned],
            Returned => &[Refunded],
            PaymentFailed | OnHold => &[Pending, Processing, Cancelled],
            Cancelled | Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        self.next_possible_statuses().contains(&target)
    }

    pub fn can_be_cancelled(&self) -> bool { self.can_transition_to(OrderStatus::Cancelled) }

    /// End of the forward flow. Delivered orders can still be returned.
    pub fn is_final(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    pub fn is_holding(&self) -> bool { matches!(self, OrderStatus::PaymentFailed | OrderStatus::OnHold) }
}

/// How callers observe a transition whose precondition does not hold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Nothing happens and the caller gets `Ok(false)`.
    #[default]
    Lenient,
    /// The caller gets [`CommerceError::InvalidOrderStatusTransition`].
    Strict,
}

impl TransitionPolicy {
    /// `Ok(true)` when the transition was applied.
    pub fn resolve(self, outcome: std::result::Result<(), InvalidTransition>) -> Result<bool> {
        match (outcome, self) {
            (Ok(()), _) => Ok(true),
            (Err(rejected), TransitionPolicy::Lenient) => {
                warn!(current = ?rejected.current, attempted = ?rejected.attempted, "order transition ignored");
                Ok(false)
            }
            (Err(rejected), TransitionPolicy::Strict) => Err(CommerceError::InvalidOrderStatusTransition(rejected)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    PartiallyShipped,
    Shipped,
    Delivered,
    Cancelled,
    Returned,
    Refunded,
}

impl ItemStatus {
    /// Whether the line still counts towards the order subtotal.
    pub fn is_billable(&self) -> bool {
        match self {
            ItemStatus::Pending
            | ItemStatus::Processing
            | ItemStatus::PartiallyShipped
            | ItemStatus::Shipped
            | ItemStatus::Delivered
            | ItemStatus::Returned
            | ItemStatus::Refunded => true,
            ItemStatus::Cancelled => false,
        }
    }

    pub fn can_be_cancelled(&self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::Processing | ItemStatus::PartiallyShipped)
    }
}

/// Frozen copy of what was bought. Later catalog edits never reach it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderLineItem {
    id: Uuid,
    product_id: Uuid,
    product_name: String,
    sku: Sku,
    description: String,
    unit_price: Money,
    quantity: u32,
    discount: Money,
    tax: Money,
    status: ItemStatus,
    shipped_quantity: u32,
    returned_quantity: u32,
}

impl OrderLineItem {
    pub fn snapshot(product_id: Uuid, product_name: impl Into<String>, sku: Sku, description: impl Into<String>, unit_price: Money, quantity: u32) -> Self {
        let currency = unit_price.currency().to_string();
        Self {
            id: Uuid::now_v7(), product_id, product_name: product_name.into(), sku, description: description.into(),
            unit_price, quantity, discount: Money::zero(&currency), tax: Money::zero(&currency),
            status: ItemStatus::Pending, shipped_quantity: 0, returned_quantity: 0,
        }
    }

    pub fn with_discount(mut self, discount: Money) -> Self { self.discount = discount; self }
    pub fn with_tax(mut self, tax: Money) -> Self { self.tax = tax; self }

    pub fn id(&self) -> Uuid { self.id }
    pub fn product_id(&self) -> Uuid { self.product_id }
    pub fn product_name(&self) -> &str { &self.product_name }
    pub fn sku(&self) -> &Sku { &self.sku }
    pub fn description(&self) -> &str { &self.description }
    pub fn unit_price(&self) -> &Money { &self.unit_price }
    pub fn quantity(&self) -> u32 { self.quantity }
    pub fn discount(&self) -> &Money { &self.discount }
    pub fn tax(&self) -> &Money { &self.tax }
    pub fn status(&self) -> ItemStatus { self.status }
    pub fn shipped_quantity(&self) -> u32 { self.shipped_quantity }
    pub fn returned_quantity(&self) -> u32 { self.returned_quantity }
    pub fn remaining_to_ship(&self) -> u32 { self.quantity - self.shipped_quantity }

    /// `unit_price * quantity - discount`, zero for lines that no longer bill.
    pub fn line_total(&self) -> Money {
        if !self.status.is_billable() { return Money::zero(self.unit_price.currency()); }
        let gross = self.unit_price.multiply(self.quantity);
        match gross.subtract(&self.discount) {
            Ok(net) if !net.is_negative() => net,
            _ => Money::zero(gross.currency()),
        }
    }

    fn billable_tax(&self) -> Money {
        if self.status.is_billable() { self.tax.clone() } else { Money::zero(self.tax.currency()) }
    }

    /// Records `qty` more units handed to the carrier.
    pub fn record_shipment(&mut self, qty: u32) -> Result<()> {
        if qty == 0 || qty > self.remaining_to_ship() {
            return Err(CommerceError::invalid("shipped_quantity", format!("can ship at most {} more of {}", self.remaining_to_ship(), self.sku)));
        }
        if !matches!(self.status, ItemStatus::Pending | ItemStatus::Processing | ItemStatus::PartiallyShipped) {
            return Err(CommerceError::invalid("status", format!("{} cannot be shipped", self.sku)));
        }
        self.shipped_quantity += qty;
        self.status = if self.shipped_quantity == self.quantity { ItemStatus::Shipped } else { ItemStatus::PartiallyShipped };
        Ok(())
    }

    /// Records `qty` units coming back from the customer.
    pub fn record_return(&mut self, qty: u32) -> Result<()> {
        if qty == 0 || self.returned_quantity + qty > self.shipped_quantity {
            return Err(CommerceError::invalid("returned_quantity", format!("can return at most {} of {}", self.shipped_quantity - self.returned_quantity, self.sku)));
        }
        if !matches!(self.status, ItemStatus::Delivered | ItemStatus::Returned) {
            return Err(CommerceError::invalid("status", format!("{} has not been delivered", self.sku)));
        }
        self.returned_quantity += qty;
        self.status = ItemStatus::Returned;
        Ok(())
    }

    fn mark(&mut self, status: ItemStatus) { self.status = status; }
}

impl Order {
    pub fn create(
        customer_id: impl Into<String>,
        email: impl Into<String>,
        currency: &str,
        shipping_address: Address,
        billing_address: Address,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), order_number: OrderNumber::generate(now), customer_id: customer_id.into(), email: email.into(),
            status: OrderStatus::Pending, currency: currency.to_uppercase(), items: vec![],
            subtotal: Money::zero(currency), tax: Money::zero(currency), shipping: Money::zero(currency),
            discount: Money::zero(currency), total: Money::zero(currency), coupon_code: None,
            shipping_address, billing_address, payment_id: None, shipment_id: None, stock_reserved: false,
            customer_notes: None, internal_notes: vec![], created_at: now, updated_at: now,
            paid_at: None, shipped_at: None, delivered_at: None, cancelled_at: None, returned_at: None, refunded_at: None,
            version: 0, events: vec![],
        }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn version(&self) -> u64 { self.version }
    pub(crate) fn set_version(&mut self, version: u64) { self.version = version; }
    pub fn order_number(&self) -> &OrderNumber { &self.order_number }
    pub fn customer_id(&self) -> &str { &self.customer_id }
    pub fn email(&self) -> &str { &self.email }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn items(&self) -> &[OrderLineItem] { &self.items }
    pub fn subtotal(&self) -> &Money { &self.subtotal }
    pub fn tax(&self) -> &Money { &self.tax }
    pub fn shipping(&self) -> &Money { &self.shipping }
    pub fn discount(&self) -> &Money { &self.discount }
    pub fn total(&self) -> &Money { &self.total }
    pub fn coupon_code(&self) -> Option<&str> { self.coupon_code.as_deref() }
    pub fn shipping_address(&self) -> &Address { &self.shipping_address }
    pub fn billing_address(&self) -> &Address { &self.billing_address }
    pub fn payment_id(&self) -> Option<Uuid> { self.payment_id }
    pub fn shipment_id(&self) -> Option<Uuid> { self.shipment_id }
    pub fn stock_reserved(&self) -> bool { self.stock_reserved }
    pub fn customer_notes(&self) -> Option<&str> { self.customer_notes.as_deref() }
    pub fn internal_notes(&self) -> &[String] { &self.internal_notes }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn paid_at(&self) -> Option<DateTime<Utc>> { self.paid_at }
    pub fn shipped_at(&self) -> Option<DateTime<Utc>> { self.shipped_at }
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> { self.delivered_at }
    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> { self.cancelled_at }
    pub fn returned_at(&self) -> Option<DateTime<Utc>> { self.returned_at }
    pub fn refunded_at(&self) -> Option<DateTime<Utc>> { self.refunded_at }

    /// Paid and still on the forward path.
    pub fn is_paid(&self) -> bool {
        self.payment_id.is_some()
            && matches!(self.status, OrderStatus::Paid | OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered)
    }

    pub fn is_shipped(&self) -> bool { self.shipped_at.is_some() }

    /// Eligible for external cleanup: still pending after `cutoff`.
    pub fn is_stale(&self, cutoff: Duration, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending && now - self.created_at > cutoff
    }

    pub fn add_item(&mut self, item: OrderLineItem) -> Result<()> {
        if self.status != OrderStatus::Pending || self.stock_reserved {
            return Err(CommerceError::invalid("items", "items can only change before the order is placed"));
        }
        if item.quantity == 0 { return Err(CommerceError::invalid("quantity", "quantity must be positive")); }
        if item.unit_price.currency() != self.currency {
            return Err(CommerceError::invalid("currency", format!("order is priced in {}", self.currency)));
        }
        self.items.push(item);
        self.update_totals();
        Ok(())
    }

    pub fn set_shipping(&mut self, shipping: Money) -> Result<()> {
        self.ensure_currency(&shipping)?;
        self.shipping = shipping;
        self.update_totals();
        Ok(())
    }

    pub fn apply_discount(&mut self, coupon_code: Option<String>, discount: Money) -> Result<()> {
        self.ensure_currency(&discount)?;
        self.coupon_code = coupon_code;
        self.discount = discount;
        self.update_totals();
        Ok(())
    }

    fn ensure_currency(&self, money: &Money) -> Result<()> {
        if money.currency() == self.currency { return Ok(()); }
        Err(CommerceError::invalid("currency", format!("order is priced in {}", self.currency)))
    }

    pub fn set_customer_notes(&mut self, notes: Option<String>) { self.customer_notes = notes; }

    /// Recomputes subtotal and tax from the lines and
    /// `total = subtotal + tax + shipping - discount`.
    /// The discount is capped at the subtotal so the total never goes negative.
    pub fn update_totals(&mut self) {
        let zero = Money::zero(&self.currency);
        let mut subtotal = zero.clone();
        let mut tax = zero.clone();
        for item in &self.items {
            subtotal = subtotal.add(&item.line_total()).unwrap_or(subtotal);
            tax = tax.add(&item.billable_tax()).unwrap_or(tax);
        }
        if let Ok(capped) = self.discount.min(&subtotal) { self.discount = capped; }
        if self.discount.is_negative() { self.discount = zero.clone(); }
        let total = subtotal.add(&tax)
            .and_then(|t| t.add(&self.shipping))
            .and_then(|t| t.subtract(&self.discount))
            .unwrap_or(zero);
        self.subtotal = subtotal;
        self.tax = tax;
        self.total = total;
        self.touch();
    }

    /// Called once the checkout debit is committed.
    pub fn mark_placed(&mut self) {
        if self.stock_reserved { return; }
        self.mark_stock_reserved();
        self.raise_event(DomainEvent::Order(OrderEvent::Placed {
            order_id: self.id, order_number: self.order_number.to_string(), customer_id: self.customer_id.clone(), total: self.total.amount(),
        }));
    }

    pub fn mark_stock_reserved(&mut self) { self.stock_reserved = true; self.touch(); }

    /// Called once the reservation has been credited back to the ledger.
    pub fn mark_stock_released(&mut self) { self.stock_reserved = false; self.touch(); }

    pub fn mark_as_paid(&mut self, payment_id: Uuid) -> std::result::Result<(), InvalidTransition> {
        self.guard(self.status == OrderStatus::Pending, OrderStatus::Paid)?;
        self.payment_id = Some(payment_id);
        self.status = OrderStatus::Paid;
        self.paid_at.get_or_insert_with(Utc::now);
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Paid { order_id: self.id, order_number: self.order_number.to_string() }));
        Ok(())
    }

    pub fn mark_as_processing(&mut self) -> std::result::Result<(), InvalidTransition> {
        self.guard(self.is_paid() && self.status == OrderStatus::Paid, OrderStatus::Processing)?;
        self.status = OrderStatus::Processing;
        for item in self.items.iter_mut().filter(|i| i.status == ItemStatus::Pending) { item.mark(ItemStatus::Processing); }
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Processing { order_id: self.id }));
        Ok(())
    }

    /// Hands every outstanding unit to the carrier under `shipment_id`.
    pub fn mark_as_shipped(&mut self, shipment_id: Uuid) -> std::result::Result<(), InvalidTransition> {
        self.guard(matches!(self.status, OrderStatus::Paid | OrderStatus::Processing), OrderStatus::Shipped)?;
        self.shipment_id = Some(shipment_id);
        self.status = OrderStatus::Shipped;
        self.shipped_at.get_or_insert_with(Utc::now);
        for item in self.items.iter_mut().filter(|i| i.status.can_be_cancelled()) {
            let remaining = item.remaining_to_ship();
            if remaining > 0 { let _ = item.record_shipment(remaining); }
        }
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Shipped { order_id: self.id, shipment_id }));
        Ok(())
    }

    pub fn mark_as_delivered(&mut self) -> std::result::Result<(), InvalidTransition> {
        self.guard(self.status == OrderStatus::Shipped && self.is_shipped(), OrderStatus::Delivered)?;
        self.status = OrderStatus::Delivered;
        self.delivered_at.get_or_insert_with(Utc::now);
        for item in self.items.iter_mut().filter(|i| i.status == ItemStatus::Shipped) { item.mark(ItemStatus::Delivered); }
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Delivered { order_id: self.id }));
        Ok(())
    }

    /// Only before shipment. The reason lands in the internal notes.
    pub fn cancel(&mut self, reason: &str) -> std::result::Result<(), InvalidTransition> {
        self.guard(self.status.can_be_cancelled() && !self.is_shipped(), OrderStatus::Cancelled)?;
        self.status = OrderStatus::Cancelled;
        self.cancelled_at.get_or_insert_with(Utc::now);
        self.internal_notes.push(format!("Cancelled: {reason}"));
        for item in self.items.iter_mut().filter(|i| i.status.can_be_cancelled()) { item.mark(ItemStatus::Cancelled); }
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Cancelled { order_id: self.id, reason: reason.to_string() }));
        Ok(())
    }

    pub fn mark_payment_failed(&mut self) -> std::result::Result<(), InvalidTransition> {
        self.guard(matches!(self.status, OrderStatus::Pending | OrderStatus::Paid), OrderStatus::PaymentFailed)?;
        self.status = OrderStatus::PaymentFailed;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::PaymentFailed { order_id: self.id }));
        Ok(())
    }

    pub fn place_on_hold(&mut self, reason: &str) -> std::result::Result<(), InvalidTransition> {
        self.guard(matches!(self.status, OrderStatus::Pending | OrderStatus::Paid), OrderStatus::OnHold)?;
        self.status = OrderStatus::OnHold;
        self.internal_notes.push(format!("On hold: {reason}"));
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::OnHold { order_id: self.id, reason: reason.to_string() }));
        Ok(())
    }

    /// Leaves a holding state: back to Processing when already paid, else Pending.
    pub fn resume(&mut self) -> std::result::Result<(), InvalidTransition> {
        let target = if self.paid_at.is_some() && self.payment_id.is_some() { OrderStatus::Processing } else { OrderStatus::Pending };
        self.guard(self.status.is_holding(), target)?;
        self.status = target;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Resumed { order_id: self.id }));
        Ok(())
    }

    pub fn mark_as_returned(&mut self, reason: &str) -> std::result::Result<(), InvalidTransition> {
        self.guard(self.status == OrderStatus::Delivered, OrderStatus::Returned)?;
        self.status = OrderStatus::Returned;
        self.returned_at.get_or_insert_with(Utc::now);
        self.internal_notes.push(format!("Returned: {reason}"));
        for item in self.items.iter_mut().filter(|i| i.status == ItemStatus::Delivered) {
            let outstanding = item.shipped_quantity - item.returned_quantity;
            if outstanding > 0 { let _ = item.record_return(outstanding); }
        }
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Returned { order_id: self.id, reason: reason.to_string() }));
        Ok(())
    }

    pub fn mark_as_refunded(&mut self) -> std::result::Result<(), InvalidTransition> {
        self.guard(self.status == OrderStatus::Returned, OrderStatus::Refunded)?;
        self.status = OrderStatus::Refunded;
        self.refunded_at.get_or_insert_with(Utc::now);
        for item in self.items.iter_mut().filter(|i| i.status == ItemStatus::Returned) { item.mark(ItemStatus::Refunded); }
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Refunded { order_id: self.id }));
        Ok(())
    }

    pub fn add_internal_note(&mut self, note: impl Into<String>) { self.internal_notes.push(note.into()); self.touch(); }

    fn guard(&self, precondition: bool, attempted: OrderStatus) -> std::result::Result<(), InvalidTransition> {
        if precondition && self.status.can_transition_to(attempted) { Ok(()) }
        else { Err(InvalidTransition::new(self.status, attempted)) }
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn usd(amount: i64) -> Money { Money::usd(Decimal::new(amount, 0)) }

    fn order_with(lines: &[(u32, i64)]) -> Order {
        let mut order = Order::create("CUST001", "test@example.com", "USD", Address::default(), Address::default());
        for (qty, price) in lines {
            order.add_item(OrderLineItem::snapshot(Uuid::now_v7(), "Widget", Sku::new("W001").unwrap(), "", usd(*price), *qty)).unwrap();
        }
        order
    }

    #[test]
    fn test_order_workflow() {
        let mut order = order_with(&[(2, 10)]);
        order.mark_placed();
        order.mark_as_paid(Uuid::now_v7()).unwrap();
        assert!(order.is_paid());
        order.mark_as_processing().unwrap();
        order.mark_as_shipped(Uuid::now_v7()).unwrap();
        assert_eq!(order.status(), OrderStatus::Shipped);
        assert_eq!(order.items()[0].status(), ItemStatus::Shipped);
        order.mark_as_delivered().unwrap();
        assert_eq!(order.status(), OrderStatus::Delivered);
        assert_eq!(order.items()[0].status(), ItemStatus::Delivered);
    }

    #[test]
    fn test_totals_formula() {
        let mut order = order_with(&[(3, 10), (1, 25)]);
        order.apply_discount(Some("SAVE5".into()), usd(5)).unwrap();
        assert_eq!(order.subtotal().amount(), Decimal::new(55, 0));
        assert_eq!(order.total().amount(), Decimal::new(50, 0));
        order.set_shipping(usd(7)).unwrap();
        assert_eq!(order.total().amount(), Decimal::new(57, 0));
    }

    #[test]
    fn test_foreign_currency_charges_are_rejected() {
        let mut order = order_with(&[(2, 10)]);
        order.set_shipping(usd(5)).unwrap();
        let err = order.set_shipping(Money::new(Decimal::new(5, 0), "EUR")).unwrap_err();
        assert!(matches!(err, CommerceError::Validation(_)));
        assert!(order.apply_discount(Some("EURO".into()), Money::new(Decimal::ONE, "EUR")).is_err());
        assert_eq!(order.shipping().amount(), Decimal::new(5, 0));
        assert_eq!(order.coupon_code(), None);
        assert_eq!(order.total().amount(), Decimal::new(25, 0));
    }

    #[test]
    fn test_mark_as_paid_only_from_pending() {
        let mut order = order_with(&[(1, 10)]);
        let payment = Uuid::now_v7();
        order.mark_as_paid(payment).unwrap();
        let first_paid_at = order.paid_at();
        let rejected = order.mark_as_paid(Uuid::now_v7()).unwrap_err();
        assert_eq!(rejected.current, OrderStatus::Paid);
        assert_eq!(order.payment_id(), Some(payment));
        assert_eq!(order.paid_at(), first_paid_at);
    }

    #[test]
    fn test_processing_requires_payment() {
        let mut order = order_with(&[(1, 10)]);
        assert!(order.mark_as_processing().is_err());
        assert_eq!(order.status(), OrderStatus::Pending);
    }

    #[test]
    fn test_delivered_twice_stamps_once() {
        let mut order = order_with(&[(1, 10)]);
        order.mark_as_paid(Uuid::now_v7()).unwrap();
        order.mark_as_shipped(Uuid::now_v7()).unwrap();
        order.mark_as_delivered().unwrap();
        let stamped = order.delivered_at();
        let policy = TransitionPolicy::Lenient;
        assert_eq!(policy.resolve(order.mark_as_delivered()), Ok(false));
        assert_eq!(order.delivered_at(), stamped);
        assert_eq!(order.status(), OrderStatus::Delivered);
    }

    #[test]
    fn test_strict_policy_raises() {
        let mut order = order_with(&[(1, 10)]);
        let err = TransitionPolicy::Strict.resolve(order.mark_as_delivered()).unwrap_err();
        match err {
            CommerceError::InvalidOrderStatusTransition(t) => {
                assert_eq!(t.current, OrderStatus::Pending);
                assert_eq!(t.attempted, OrderStatus::Delivered);
                assert!(t.valid_targets.contains(&OrderStatus::Paid));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancel_rules() {
        let mut shipped = order_with(&[(1, 10)]);
        shipped.mark_as_paid(Uuid::now_v7()).unwrap();
        shipped.mark_as_shipped(Uuid::now_v7()).unwrap();
        assert!(shipped.cancel("too late").is_err());
        assert_eq!(shipped.status(), OrderStatus::Shipped);

        let mut paid = order_with(&[(1, 10)]);
        paid.mark_as_paid(Uuid::now_v7()).unwrap();
        paid.cancel("changed mind").unwrap();
        assert_eq!(paid.status(), OrderStatus::Cancelled);
        assert!(paid.cancelled_at().is_some());
        assert_eq!(paid.internal_notes(), ["Cancelled: changed mind".to_string()]);
        assert_eq!(paid.items()[0].status(), ItemStatus::Cancelled);
        assert!(paid.cancel("again").is_err());
    }

    #[test]
    fn test_cancelled_lines_drop_out_of_totals() {
        let mut order = order_with(&[(2, 10)]);
        order.cancel("no longer needed").unwrap();
        order.update_totals();
        assert!(order.subtotal().is_zero());
        assert!(order.total().is_zero());
    }

    #[test]
    fn test_holding_states() {
        let mut order = order_with(&[(1, 10)]);
        order.mark_payment_failed().unwrap();
        assert_eq!(order.status(), OrderStatus::PaymentFailed);
        order.resume().unwrap();
        assert_eq!(order.status(), OrderStatus::Pending);

        order.mark_as_paid(Uuid::now_v7()).unwrap();
        order.place_on_hold("fraud review").unwrap();
        order.resume().unwrap();
        assert_eq!(order.status(), OrderStatus::Processing);
    }

    #[test]
    fn test_return_and_refund() {
        let mut order = order_with(&[(2, 10)]);
        order.mark_as_paid(Uuid::now_v7()).unwrap();
        assert!(order.mark_as_returned("broken").is_err());
        order.mark_as_shipped(Uuid::now_v7()).unwrap();
        order.mark_as_delivered().unwrap();
        order.mark_as_returned("broken").unwrap();
        assert_eq!(order.items()[0].returned_quantity(), 2);
        order.mark_as_refunded().unwrap();
        assert_eq!(order.status(), OrderStatus::Refunded);
        assert!(order.status().next_possible_statuses().is_empty());
    }

    #[test]
    fn test_line_item_partial_shipment_bounds() {
        let mut item = OrderLineItem::snapshot(Uuid::now_v7(), "Widget", Sku::new("W1").unwrap(), "", usd(10), 3);
        item.record_shipment(2).unwrap();
        assert_eq!(item.status(), ItemStatus::PartiallyShipped);
        assert!(item.record_shipment(2).is_err());
        item.record_shipment(1).unwrap();
        assert_eq!(item.status(), ItemStatus::Shipped);
        assert!(item.record_return(1).is_err());
    }

    #[test]
    fn test_stale_pending() {
        let order = order_with(&[(1, 10)]);
        let later = order.created_at() + Duration::hours(25);
        assert!(order.is_stale(Duration::hours(24), later));
        assert!(!order.is_stale(Duration::hours(24), order.created_at()));
    }
}

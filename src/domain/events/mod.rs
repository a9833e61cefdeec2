//! Domain events
//!
//! Aggregates raise events as they change; the service drains them after the
//! change is persisted and hands them to the notification dispatcher.

use crate::domain::ledger::TransactionKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "aggregate", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Product(ProductEvent),
    Order(OrderEvent),
    Payment(PaymentEvent),
    Shipment(ShipmentEvent),
}

impl DomainEvent {
    /// Dot-separated routing key, e.g. `order.paid`.
    pub fn routing_key(&self) -> String {
        let (aggregate, name) = match self {
            DomainEvent::Product(e) => ("product", e.name()),
            DomainEvent::Order(e) => ("order", e.name()),
            DomainEvent::Payment(e) => ("payment", e.name()),
            DomainEvent::Shipment(e) => ("shipment", e.name()),
        };
        format!("{aggregate}.{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductEvent {
    StockChanged { product_id: Uuid, kind: TransactionKind, quantity_change: i64, quantity_after: u32 },
    ReorderPointReached { product_id: Uuid, sku: String, stock_quantity: u32, reorder_point: u32 },
    Deactivated { product_id: Uuid },
}

impl ProductEvent {
    fn name(&self) -> &'static str {
        match self {
            ProductEvent::StockChanged { .. } => "stock_changed",
            ProductEvent::ReorderPointReached { .. } => "reorder_point_reached",
            ProductEvent::Deactivated { .. } => "deactivated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { order_id: Uuid, order_number: String, customer_id: String, total: Decimal },
    Paid { order_id: Uuid, order_number: String },
    Processing { order_id: Uuid },
    Shipped { order_id: Uuid, shipment_id: Uuid },
    Delivered { order_id: Uuid },
    Cancelled { order_id: Uuid, reason: String },
    PaymentFailed { order_id: Uuid },
    OnHold { order_id: Uuid, reason: String },
    Resumed { order_id: Uuid },
    Returned { order_id: Uuid, reason: String },
    Refunded { order_id: Uuid },
}

impl OrderEvent {
    fn name(&self) -> &'static str {
        match self {
            OrderEvent::Placed { .. } => "placed",
            OrderEvent::Paid { .. } => "paid",
            OrderEvent::Processing { .. } => "processing",
            OrderEvent::Shipped { .. } => "shipped",
            OrderEvent::Delivered { .. } => "delivered",
            OrderEvent::Cancelled { .. } => "cancelled",
            OrderEvent::PaymentFailed { .. } => "payment_failed",
            OrderEvent::OnHold { .. } => "on_hold",
            OrderEvent::Resumed { .. } => "resumed",
            OrderEvent::Returned { .. } => "returned",
            OrderEvent::Refunded { .. } => "refunded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    Completed { payment_id: Uuid, order_id: Uuid, transaction_id: String, amount: Decimal },
    Failed { payment_id: Uuid, order_id: Uuid, reason: String, retry_count: u32, can_retry: bool },
    Refunded { payment_id: Uuid, order_id: Uuid, amount: Decimal, partial: bool },
    Cancelled { payment_id: Uuid, order_id: Uuid, reason: String },
}

impl PaymentEvent {
    fn name(&self) -> &'static str {
        match self {
            PaymentEvent::Completed { .. } => "completed",
            PaymentEvent::Failed { .. } => "failed",
            PaymentEvent::Refunded { .. } => "refunded",
            PaymentEvent::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShipmentEvent {
    Dispatched { shipment_id: Uuid, order_id: Uuid, carrier: String, tracking_number: String },
    TrackingUpdated { shipment_id: Uuid, status: String, location: Option<String> },
    Delivered { shipment_id: Uuid, order_id: Uuid },
    Exception { shipment_id: Uuid, order_id: Uuid, description: String },
    Cancelled { shipment_id: Uuid, order_id: Uuid },
}

impl ShipmentEvent {
    fn name(&self) -> &'static str {
        match self {
            ShipmentEvent::Dispatched { .. } => "dispatched",
            ShipmentEvent::TrackingUpdated { .. } => "tracking_updated",
            ShipmentEvent::Delivered { .. } => "delivered",
            ShipmentEvent::Exception { .. } => "exception",
            ShipmentEvent::Cancelled { .. } => "cancelled",
        }
    }
}

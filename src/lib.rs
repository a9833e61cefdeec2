//! shopcore - order, inventory and payment consistency core
//!
//! Keeps a self-hosted shop's stock, orders, payments and shipments in step.
//!
//! ## Features
//! - Stock counters backed by an append-only movement ledger
//! - Cart checkout that reserves every line or none
//! - Order lifecycle state machine with configurable strictness
//! - Payments with retries, refunds and idempotent completion
//! - Shipments with carrier tracking history
//! - Postgres or in-memory storage, NATS or log notifications

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod notify;
pub mod service;
pub mod store;

pub use config::{AppConfig, CoreConfig, PaymentFailurePolicy};
pub use domain::aggregates::{
    Cart, CartItem, Order, OrderLineItem, OrderStatus, Payment, PaymentMethod, PaymentStatus, Product, Shipment,
    ShipmentStatus, TransitionPolicy,
};
pub use domain::value_objects::{Address, Money, Sku};
pub use error::{CommerceError, Result};
pub use service::CommerceService;

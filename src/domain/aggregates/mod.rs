//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;
pub mod payment;
pub mod shipment;

pub use product::{Product, ProductStatus};
pub use order::{ItemStatus, Order, OrderLineItem, OrderStatus, TransitionPolicy};
pub use cart::{Cart, CartItem, DEFAULT_CART_TTL_DAYS};
pub use payment::{Payment, PaymentMethod, PaymentStatus, DEFAULT_MAX_RETRIES};
pub use shipment::{ExceptionType, Shipment, ShipmentStatus, TrackingEvent};

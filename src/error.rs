//! Error taxonomy for the commerce core.
//!
//! Every error carries a stable machine-readable [`code`](CommerceError::code)
//! and a pre-composed [`user_message`](CommerceError::user_message) that can be
//! shown to a shopper as-is.

use crate::domain::aggregates::OrderStatus;
use crate::domain::value_objects::MoneyError;
use axum::http::StatusCode;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommerceError {
    #[error("insufficient stock for {product_name} ({product_id}): requested {requested}, available {available}")]
    InsufficientStock { product_id: Uuid, product_name: String, requested: u32, available: u32 },

    #[error("invalid order status transition: {0}")]
    InvalidOrderStatusTransition(InvalidTransition),

    #[error("payment error: {0}")]
    Payment(PaymentError),

    #[error("shipping error: {0}")]
    Shipping(ShippingError),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, CommerceError>;

impl CommerceError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound { resource, id: id.to_string() }
    }

    /// Single-field validation failure.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(field, message);
        Self::Validation(errors)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::InvalidOrderStatusTransition(_) => "INVALID_ORDER_STATUS_TRANSITION",
            Self::Payment(e) => e.kind.code(),
            Self::Shipping(e) => e.kind.code(),
            Self::NotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Conflict(_) => "CONFLICT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientStock { product_name, requested, available, .. } => match available {
                0 => format!("{product_name} is out of stock"),
                1 => format!("Only 1 unit of {product_name} is available, but you requested {requested}"),
                n => format!("Only {n} units of {product_name} are available, but you requested {requested}"),
            },
            Self::InvalidOrderStatusTransition(t) => format!(
                "This order is {} and cannot be changed to {}",
                t.current.display_name().to_lowercase(),
                t.attempted.display_name().to_lowercase()
            ),
            Self::Payment(e) => e.kind.user_message().to_string(),
            Self::Shipping(e) => e.kind.user_message().to_string(),
            Self::NotFound { resource, .. } => format!("The requested {resource} could not be found"),
            Self::Validation(errors) => errors.to_string(),
            Self::Conflict(_) => "The request conflicts with the current state, please retry".to_string(),
            Self::Storage(_) => "Something went wrong on our side, please try again later".to_string(),
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Payment(e) => e.kind.is_retryable(),
            Self::Shipping(e) => e.kind == ShippingErrorKind::CarrierUnavailable,
            Self::Conflict(_) | Self::Storage(_) => true,
            _ => false,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InsufficientStock { .. } | Self::InvalidOrderStatusTransition(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Payment(e) if e.kind == PaymentErrorKind::DuplicateTransaction => StatusCode::CONFLICT,
            Self::Payment(e) if e.kind.is_retryable() => StatusCode::BAD_GATEWAY,
            Self::Payment(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Shipping(e) if e.kind == ShippingErrorKind::CarrierUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Shipping(e) if e.kind == ShippingErrorKind::DuplicateTrackingNumber => StatusCode::CONFLICT,
            Self::Shipping(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PaymentError> for CommerceError {
    fn from(e: PaymentError) -> Self { Self::Payment(e) }
}

impl From<ShippingError> for CommerceError {
    fn from(e: ShippingError) -> Self { Self::Shipping(e) }
}

impl From<ValidationErrors> for CommerceError {
    fn from(e: ValidationErrors) -> Self { Self::Validation(e) }
}

impl From<MoneyError> for CommerceError {
    fn from(e: MoneyError) -> Self { Self::invalid("currency", e.to_string()) }
}

impl From<validator::ValidationErrors> for CommerceError {
    fn from(e: validator::ValidationErrors) -> Self { Self::Validation(e.into()) }
}

impl From<sqlx::Error> for CommerceError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(db.message().to_string()),
            _ => Self::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CommerceError {
    fn from(e: serde_json::Error) -> Self { Self::Storage(format!("serialization: {e}")) }
}

/// An order status change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidTransition {
    pub current: OrderStatus,
    pub attempted: OrderStatus,
    pub valid_targets: Vec<OrderStatus>,
}

impl InvalidTransition {
    pub fn new(current: OrderStatus, attempted: OrderStatus) -> Self {
        Self { current, attempted, valid_targets: current.next_possible_statuses().to_vec() }
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {:?} (allowed: {:?})", self.current, self.attempted, self.valid_targets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaymentErrorKind {
    InsufficientFunds,
    InvalidCard,
    ExpiredCard,
    GatewayError,
    NetworkError,
    DuplicateTransaction,
    FraudSuspected,
    AuthorizationFailed,
    CaptureFailed,
    RefundFailed,
    RetriesExhausted,
    InvalidState,
}

impl PaymentErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds => "PAYMENT_INSUFFICIENT_FUNDS",
            Self::InvalidCard => "PAYMENT_INVALID_CARD",
            Self::ExpiredCard => "PAYMENT_EXPIRED_CARD",
            Self::GatewayError => "PAYMENT_GATEWAY_ERROR",
            Self::NetworkError => "PAYMENT_NETWORK_ERROR",
            Self::DuplicateTransaction => "PAYMENT_DUPLICATE_TRANSACTION",
            Self::FraudSuspected => "PAYMENT_FRAUD_SUSPECTED",
            Self::AuthorizationFailed => "PAYMENT_AUTHORIZATION_FAILED",
            Self::CaptureFailed => "PAYMENT_CAPTURE_FAILED",
            Self::RefundFailed => "PAYMENT_REFUND_FAILED",
            Self::RetriesExhausted => "PAYMENT_RETRIES_EXHAUSTED",
            Self::InvalidState => "PAYMENT_INVALID_STATE",
        }
    }

    /// Transient failures worth another attempt against the gateway.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayError | Self::NetworkError | Self::CaptureFailed | Self::AuthorizationFailed)
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InsufficientFunds => "Your payment was declined due to insufficient funds",
            Self::InvalidCard => "The card details are invalid, please check and try again",
            Self::ExpiredCard => "Your card has expired, please use a different card",
            Self::GatewayError => "The payment provider is having problems, please try again shortly",
            Self::NetworkError => "We could not reach the payment provider, please try again",
            Self::DuplicateTransaction => "This payment has already been processed",
            Self::FraudSuspected => "This payment could not be completed, please contact support",
            Self::AuthorizationFailed => "The payment could not be authorized, please try again",
            Self::CaptureFailed => "The payment could not be captured, please try again",
            Self::RefundFailed => "The refund could not be processed",
            Self::RetriesExhausted => "Too many failed payment attempts, please contact support",
            Self::InvalidState => "This payment cannot be changed in its current state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{}", .kind.code(), .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct PaymentError {
    pub kind: PaymentErrorKind,
    pub detail: Option<String>,
}

impl PaymentError {
    pub fn new(kind: PaymentErrorKind) -> Self { Self { kind, detail: None } }
    pub fn with_detail(kind: PaymentErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: Some(detail.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShippingErrorKind {
    InvalidAddress,
    IncompleteAddress,
    CarrierUnavailable,
    WeightExceeded,
    DimensionsExceeded,
    CannotCancel,
    AlreadyDelivered,
    DuplicateTrackingNumber,
    ShipmentCancelled,
}

impl ShippingErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress => "SHIPPING_INVALID_ADDRESS",
            Self::IncompleteAddress => "SHIPPING_INCOMPLETE_ADDRESS",
            Self::CarrierUnavailable => "SHIPPING_CARRIER_UNAVAILABLE",
            Self::WeightExceeded => "SHIPPING_WEIGHT_EXCEEDED",
            Self::DimensionsExceeded => "SHIPPING_DIMENSIONS_EXCEEDED",
            Self::CannotCancel => "SHIPPING_CANNOT_CANCEL",
            Self::AlreadyDelivered => "SHIPPING_ALREADY_DELIVERED",
            Self::DuplicateTrackingNumber => "SHIPPING_DUPLICATE_TRACKING_NUMBER",
            Self::ShipmentCancelled => "SHIPPING_SHIPMENT_CANCELLED",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidAddress => "The shipping address is not valid",
            Self::IncompleteAddress => "The shipping address is incomplete",
            Self::CarrierUnavailable => "The selected carrier is currently unavailable",
            Self::WeightExceeded => "The package exceeds the carrier's weight limit",
            Self::DimensionsExceeded => "The package exceeds the carrier's size limit",
            Self::CannotCancel => "This shipment can no longer be cancelled",
            Self::AlreadyDelivered => "This shipment has already been delivered",
            Self::DuplicateTrackingNumber => "This tracking number is already in use",
            Self::ShipmentCancelled => "This shipment has been cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{}", .kind.code(), .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct ShippingError {
    pub kind: ShippingErrorKind,
    pub detail: Option<String>,
}

impl ShippingError {
    pub fn new(kind: ShippingErrorKind) -> Self { Self { kind, detail: None } }
    pub fn with_detail(kind: ShippingErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: Some(detail.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

/// Field-level violations, collected before anything is surfaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    violations: Vec<FieldViolation>,
}

impl ValidationErrors {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(FieldViolation { field: field.into(), message: message.into() });
    }

    pub fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok { self.add(field, message); }
    }

    pub fn violations(&self) -> &[FieldViolation] { &self.violations }
    pub fn is_empty(&self) -> bool { self.violations.is_empty() }

    pub fn merge(&mut self, other: ValidationErrors) { self.violations.extend(other.violations); }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() { Ok(()) } else { Err(CommerceError::Validation(self)) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.violations.iter().map(|v| format!("{}: {}", v.field, v.message)).collect();
        f.write_str(&parts.join("; "))
    }
}

impl From<validator::ValidationErrors> for ValidationErrors {
    fn from(e: validator::ValidationErrors) -> Self {
        let mut out = ValidationErrors::new();
        let mut fields: Vec<_> = e.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (field, errors) in fields {
            for error in errors {
                let message = error.message.as_ref().map(|m| m.to_string()).unwrap_or_else(|| error.code.to_string());
                out.add(field, message);
            }
        }
        out
    }
}

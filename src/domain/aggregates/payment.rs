//! Payment Aggregate
//!
//! One payment per order attempt. Completion is idempotent on the gateway
//! transaction id, failures count against a retry cap, and refunds accumulate
//! until the full amount has been returned.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use crate::domain::events::{DomainEvent, PaymentEvent};
use crate::domain::value_objects::Money;
use crate::error::{CommerceError, PaymentError, PaymentErrorKind, Result, ValidationErrors};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    id: Uuid,
    order_id: Uuid,
    transaction_id: Option<String>,
    authorization_code: Option<String>,
    method: PaymentMethod,
    amount: Money,
    status: PaymentStatus,
    refund_amount: Money,
    refund_reason: Option<String>,
    retry_count: u32,
    max_retries: u32,
    failure_reason: Option<String>,
    gateway_response: BTreeMap<String, String>,
    verified: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    version: u64,
    #[serde(skip)]
    events: Vec<DomainEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { PayPal, CreditCard, DebitCard, BankTransfer, CashOnDelivery }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
        }
    }

    /// Money has been captured (possibly partly returned since).
    pub fn is_captured(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded)
    }

    pub fn is_refundable(&self) -> bool { matches!(self, PaymentStatus::Completed | PaymentStatus::PartiallyRefunded) }
}

impl Payment {
    pub fn new(order_id: Uuid, method: PaymentMethod, amount: Money) -> Result<Self> {
        if !amount.is_positive() { return Err(CommerceError::invalid("amount", "payment amount must be positive")); }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(), order_id, transaction_id: None, authorization_code: None, method,
            refund_amount: Money::zero(amount.currency()), amount, status: PaymentStatus::Pending, refund_reason: None,
            retry_count: 0, max_retries: DEFAULT_MAX_RETRIES, failure_reason: None, gateway_response: BTreeMap::new(),
            verified: false, created_at: now, updated_at: now,
            completed_at: None, failed_at: None, refunded_at: None, cancelled_at: None, version: 0, events: vec![],
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self { self.max_retries = max_retries; self }

    pub fn id(&self) -> Uuid { self.id }
    pub fn version(&self) -> u64 { self.version }
    pub(crate) fn set_version(&mut self, version: u64) { self.version = version; }
    pub fn order_id(&self) -> Uuid { self.order_id }
    pub fn transaction_id(&self) -> Option<&str> { self.transaction_id.as_deref() }
    pub fn authorization_code(&self) -> Option<&str> { self.authorization_code.as_deref() }
    pub fn method(&self) -> PaymentMethod { self.method }
    pub fn amount(&self) -> &Money { &self.amount }
    pub fn status(&self) -> PaymentStatus { self.status }
    pub fn refund_amount(&self) -> &Money { &self.refund_amount }
    pub fn refund_reason(&self) -> Option<&str> { self.refund_reason.as_deref() }
    pub fn retry_count(&self) -> u32 { self.retry_count }
    pub fn max_retries(&self) -> u32 { self.max_retries }
    pub fn failure_reason(&self) -> Option<&str> { self.failure_reason.as_deref() }
    pub fn gateway_response(&self) -> &BTreeMap<String, String> { &self.gateway_response }
    pub fn is_verified(&self) -> bool { self.verified }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn completed_at(&self) -> Option<DateTime<Utc>> { self.completed_at }
    pub fn refunded_at(&self) -> Option<DateTime<Utc>> { self.refunded_at }
    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> { self.cancelled_at }

    pub fn can_retry(&self) -> bool { self.retry_count < self.max_retries }

    /// Failed for good: no attempts left.
    pub fn is_exhausted(&self) -> bool { self.status == PaymentStatus::Failed && !self.can_retry() }

    /// Strictly between nothing and everything refunded.
    pub fn is_partial_refund(&self) -> bool {
        self.refund_amount.is_positive() && self.refund_amount.amount() < self.amount.amount()
    }

    pub fn refundable_amount(&self) -> Money {
        self.amount.subtract(&self.refund_amount).unwrap_or_else(|_| Money::zero(self.amount.currency()))
    }

    pub fn is_stale(&self, cutoff: Duration, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && now - self.created_at > cutoff
    }

    pub fn record_gateway_response(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.gateway_response.insert(key.into(), value.into());
        self.touch();
    }

    pub fn mark_as_processing(&mut self) -> std::result::Result<(), PaymentError> {
        if self.status != PaymentStatus::Pending {
            return Err(self.invalid_state("only pending payments can start processing"));
        }
        self.status = PaymentStatus::Processing;
        self.touch();
        Ok(())
    }

    /// `Ok(false)` when the payment was already completed with the same transaction.
    pub fn mark_as_completed(&mut self, transaction_id: &str, authorization_code: Option<&str>) -> std::result::Result<bool, PaymentError> {
        let transaction_id = transaction_id.trim();
        if transaction_id.is_empty() { return Err(self.invalid_state("transaction id is required")); }
        if self.status.is_captured() {
            return match self.transaction_id.as_deref() {
                Some(existing) if existing == transaction_id => Ok(false),
                _ => Err(PaymentError::with_detail(PaymentErrorKind::DuplicateTransaction, format!("payment {} was already completed", self.id))),
            };
        }
        match self.status {
            PaymentStatus::Cancelled => return Err(self.invalid_state("payment was cancelled")),
            PaymentStatus::Failed if !self.can_retry() => return Err(self.exhausted()),
            _ => {}
        }
        self.status = PaymentStatus::Completed;
        self.transaction_id = Some(transaction_id.to_string());
        self.authorization_code = authorization_code.map(str::to_string);
        self.verified = true;
        self.failure_reason = None;
        self.completed_at.get_or_insert_with(Utc::now);
        self.touch();
        self.raise_event(DomainEvent::Payment(PaymentEvent::Completed {
            payment_id: self.id, order_id: self.order_id, transaction_id: transaction_id.to_string(), amount: self.amount.amount(),
        }));
        Ok(true)
    }

    /// Counts one failed attempt. Once the cap is reached further failures
    /// are rejected and nothing changes.
    pub fn mark_as_failed(&mut self, reason: &str) -> std::result::Result<(), PaymentError> {
        if !matches!(self.status, PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Failed) {
            return Err(self.invalid_state("only open payments can fail"));
        }
        if !self.can_retry() { return Err(self.exhausted()); }
        self.retry_count += 1;
        self.status = PaymentStatus::Failed;
        self.failure_reason = Some(reason.to_string());
        self.failed_at = Some(Utc::now());
        self.touch();
        self.raise_event(DomainEvent::Payment(PaymentEvent::Failed {
            payment_id: self.id, order_id: self.order_id, reason: reason.to_string(), retry_count: self.retry_count, can_retry: self.can_retry(),
        }));
        Ok(())
    }

    /// Reopens a failed payment for another attempt.
    pub fn retry(&mut self) -> std::result::Result<(), PaymentError> {
        if self.status != PaymentStatus::Failed { return Err(self.invalid_state("only failed payments can be retried")); }
        if !self.can_retry() { return Err(self.exhausted()); }
        self.status = PaymentStatus::Pending;
        self.touch();
        Ok(())
    }

    /// Refunds `amount` on top of earlier refunds. Every violation is reported
    /// at once and none of them changes the payment.
    pub fn process_refund(&mut self, amount: &Money, reason: &str) -> Result<()> {
        if !self.status.is_refundable() {
            return Err(self.invalid_state("only completed payments can be refunded").into());
        }
        let mut errors = ValidationErrors::new();
        errors.check(amount.is_positive(), "amount", "refund amount must be positive");
        errors.check(amount.currency() == self.amount.currency(), "currency", "refund currency must match the payment");
        errors.check(amount.amount() <= self.refundable_amount().amount(), "amount", "refund exceeds the refundable amount");
        errors.check(!reason.trim().is_empty(), "reason", "refund reason is required");
        errors.into_result()?;

        self.refund_amount = self.refund_amount.add(amount)?;
        self.refund_reason = Some(reason.to_string());
        if self.refund_amount.amount() == self.amount.amount() {
            self.status = PaymentStatus::Refunded;
            self.refunded_at.get_or_insert_with(Utc::now);
        } else {
            self.status = PaymentStatus::PartiallyRefunded;
        }
        self.touch();
        self.raise_event(DomainEvent::Payment(PaymentEvent::Refunded {
            payment_id: self.id, order_id: self.order_id, amount: amount.amount(), partial: self.is_partial_refund(),
        }));
        Ok(())
    }

    /// Captured payments must be refunded instead. `Ok(false)` when already cancelled.
    pub fn cancel_payment(&mut self, reason: &str) -> std::result::Result<bool, PaymentError> {
        if self.status.is_captured() { return Err(self.invalid_state("completed payments must be refunded")); }
        if self.status == PaymentStatus::Cancelled { return Ok(false); }
        self.status = PaymentStatus::Cancelled;
        self.failure_reason = Some(reason.to_string());
        self.cancelled_at.get_or_insert_with(Utc::now);
        self.touch();
        self.raise_event(DomainEvent::Payment(PaymentEvent::Cancelled { payment_id: self.id, order_id: self.order_id, reason: reason.to_string() }));
        Ok(true)
    }

    fn invalid_state(&self, detail: &str) -> PaymentError {
        PaymentError::with_detail(PaymentErrorKind::InvalidState, format!("{detail} (status {})", self.status.as_str()))
    }

    fn exhausted(&self) -> PaymentError {
        PaymentError::with_detail(PaymentErrorKind::RetriesExhausted, format!("{} of {} attempts used", self.retry_count, self.max_retries))
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

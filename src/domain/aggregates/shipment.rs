//! Shipment Aggregate
//!
//! Carrier callbacks arrive out of order, so the denormalized status is
//! last-write-wins while the tracking history only ever grows and its
//! timestamps never go backwards.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;
use crate::domain::events::{DomainEvent, ShipmentEvent};
use crate::domain::value_objects::Address;
use crate::error::{Result, ShippingError, ShippingErrorKind, ValidationErrors};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Shipment {
    id: Uuid,
    order_id: Uuid,
    tracking_number: String,
    carrier: String,
    status: ShipmentStatus,
    shipping_address: Address,
    shipment_date: Option<DateTime<Utc>>,
    estimated_delivery_date: Option<NaiveDate>,
    actual_delivery_date: Option<NaiveDate>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    current_location: Option<String>,
    last_location: Option<String>,
    tracking_history: Vec<TrackingEvent>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    version: u64,
    #[serde(skip)]
    events: Vec<DomainEvent>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    #[default]
    Pending,
    Shipped,
    InTransit,
    OutForDelivery,
    Delivered,
    Exception,
    Cancelled,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::Shipped => "shipped",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::OutForDelivery => "out_for_delivery",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Exception => "exception",
            ShipmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_in_transit(&self) -> bool {
        matches!(self, ShipmentStatus::Shipped | ShipmentStatus::InTransit | ShipmentStatus::OutForDelivery)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType { WeatherDelay, AddressIssue, Damaged, Lost, CustomsHold, Other }

/// One carrier status report. Never modified once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub status: ShipmentStatus,
    pub location: Option<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub exception_type: Option<ExceptionType>,
}

impl Shipment {
    pub fn create(
        order_id: Uuid,
        carrier: &str,
        tracking_number: &str,
        shipping_address: Address,
        estimated_delivery_date: Option<NaiveDate>,
    ) -> Result<Self> {
        let mut errors = ValidationErrors::new();
        errors.check(!carrier.trim().is_empty(), "carrier", "carrier is required");
        errors.check(!tracking_number.trim().is_empty(), "tracking_number", "tracking number is required");
        errors.into_result()?;
        if let Err(invalid) = shipping_address.validate() {
            let detail = ValidationErrors::from(invalid).to_string();
            return Err(ShippingError::with_detail(ShippingErrorKind::IncompleteAddress, detail).into());
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(), order_id, tracking_number: tracking_number.trim().to_string(), carrier: carrier.trim().to_string(),
            status: ShipmentStatus::Pending, shipping_address, shipment_date: None, estimated_delivery_date,
            actual_delivery_date: None, delivered_at: None, cancelled_at: None, current_location: None, last_location: None,
            tracking_history: vec![], created_at: now, updated_at: now, version: 0, events: vec![],
        })
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn version(&self) -> u64 { self.version }
    pub(crate) fn set_version(&mut self, version: u64) { self.version = version; }
    pub fn order_id(&self) -> Uuid { self.order_id }
    pub fn tracking_number(&self) -> &str { &self.tracking_number }
    pub fn carrier(&self) -> &str { &self.carrier }
    pub fn status(&self) -> ShipmentStatus { self.status }
    pub fn shipping_address(&self) -> &Address { &self.shipping_address }
    pub fn shipment_date(&self) -> Option<DateTime<Utc>> { self.shipment_date }
    pub fn estimated_delivery_date(&self) -> Option<NaiveDate> { self.estimated_delivery_date }
    pub fn actual_delivery_date(&self) -> Option<NaiveDate> { self.actual_delivery_date }
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> { self.delivered_at }
    pub fn current_location(&self) -> Option<&str> { self.current_location.as_deref() }
    pub fn last_location(&self) -> Option<&str> { self.last_location.as_deref() }
    pub fn tracking_history(&self) -> &[TrackingEvent] { &self.tracking_history }
    pub fn latest_tracking(&self) -> Option<&TrackingEvent> { self.tracking_history.last() }
    pub fn is_delivered(&self) -> bool { self.delivered_at.is_some() }

    pub fn tracking_url(&self) -> Option<String> {
        let base = match self.carrier.to_lowercase().as_str() {
            "dhl" => "https://www.dhl.com/track?AWB=",
            "fedex" => "https://www.fedex.com/track?tracknumber=",
            "ups" => "https://www.ups.com/track?tracknum=",
            "usps" => "https://tools.usps.com/go/TrackConfirmAction?qtc_tLabels1=",
            _ => return None,
        };
        Some(format!("{base}{}", self.tracking_number))
    }

    /// Hands the parcel to the carrier. `false` if it already left.
    pub fn ship(&mut self) -> bool {
        if self.status != ShipmentStatus::Pending { return false; }
        let now = Utc::now();
        self.status = ShipmentStatus::Shipped;
        self.shipment_date = Some(now);
        self.tracking_history.push(TrackingEvent {
            status: ShipmentStatus::Shipped, location: None, description: format!("Handed to {}", self.carrier), timestamp: now, exception_type: None,
        });
        self.touch();
        self.raise_event(DomainEvent::Shipment(ShipmentEvent::Dispatched {
            shipment_id: self.id, order_id: self.order_id, carrier: self.carrier.clone(), tracking_number: self.tracking_number.clone(),
        }));
        true
    }

    /// Appends a carrier report. Returns `true` only for the first report
    /// that moves the shipment into `Delivered`.
    pub fn add_tracking_update(
        &mut self,
        status: ShipmentStatus,
        location: Option<String>,
        description: &str,
        exception_type: Option<ExceptionType>,
    ) -> std::result::Result<bool, ShippingError> {
        if self.status == ShipmentStatus::Cancelled {
            return Err(ShippingError::with_detail(ShippingErrorKind::ShipmentCancelled, self.tracking_number.clone()));
        }
        let now = Utc::now();
        let timestamp = self.latest_tracking().map_or(now, |last| last.timestamp.max(now));
        let exception_type = match status {
            ShipmentStatus::Exception => Some(exception_type.unwrap_or(ExceptionType::Other)),
            _ => exception_type,
        };
        self.tracking_history.push(TrackingEvent {
            status, location: location.clone(), description: description.to_string(), timestamp, exception_type,
        });
        if location.is_some() {
            self.last_location = self.current_location.take();
            self.current_location = location.clone();
        }
        self.status = status;
        if status.is_in_transit() && self.shipment_date.is_none() { self.shipment_date = Some(timestamp); }
        self.touch();
        self.raise_event(DomainEvent::Shipment(ShipmentEvent::TrackingUpdated {
            shipment_id: self.id, status: status.as_str().to_string(), location,
        }));

        match status {
            ShipmentStatus::Delivered if self.delivered_at.is_none() => {
                self.delivered_at = Some(timestamp);
                self.actual_delivery_date = Some(timestamp.date_naive());
                self.raise_event(DomainEvent::Shipment(ShipmentEvent::Delivered { shipment_id: self.id, order_id: self.order_id }));
                Ok(true)
            }
            ShipmentStatus::Exception => {
                self.raise_event(DomainEvent::Shipment(ShipmentEvent::Exception {
                    shipment_id: self.id, order_id: self.order_id, description: description.to_string(),
                }));
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Past the estimated date and not delivered yet.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match self.estimated_delivery_date {
            Some(eta) => !self.is_delivered() && self.status != ShipmentStatus::Cancelled && now.date_naive() > eta,
            None => false,
        }
    }

    /// Whole days from hand-over to delivery, or to `now` while under way.
    pub fn days_in_transit(&self, now: DateTime<Utc>) -> i64 {
        let Some(shipped) = self.shipment_date else { return 0 };
        let end = self.delivered_at.unwrap_or(now);
        (end - shipped).num_days().max(0)
    }

    /// Only before the carrier has the parcel. `Ok(false)` when already cancelled.
    pub fn cancel(&mut self) -> std::result::Result<bool, ShippingError> {
        match self.status {
            ShipmentStatus::Cancelled => Ok(false),
            ShipmentStatus::Delivered => Err(ShippingError::with_detail(ShippingErrorKind::AlreadyDelivered, self.tracking_number.clone())),
            ShipmentStatus::Pending | ShipmentStatus::Exception => {
                self.status = ShipmentStatus::Cancelled;
                self.cancelled_at.get_or_insert_with(Utc::now);
                self.touch();
                self.raise_event(DomainEvent::Shipment(ShipmentEvent::Cancelled { shipment_id: self.id, order_id: self.order_id }));
                Ok(true)
            }
            _ => Err(ShippingError::with_detail(ShippingErrorKind::CannotCancel, format!("shipment is {}", self.status.as_str()))),
        }
    }

    pub fn estimate_from(shipped: DateTime<Utc>, transit_days: i64) -> NaiveDate {
        (shipped + Duration::days(transit_days)).date_naive()
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommerceError;

    fn address() -> Address {
        Address { name: "Ada".into(), street1: "1 Loop".into(), city: "Oslo".into(), zip: "0150".into(), country: "NO".into(), ..Default::default() }
    }

    fn shipped() -> Shipment {
        let mut s = Shipment::create(Uuid::now_v7(), "UPS", "1Z999", address(), Some(Utc::now().date_naive())).unwrap();
        assert!(s.ship());
        s
    }

    #[test]
    fn test_create_validates() {
        assert!(matches!(Shipment::create(Uuid::nil(), " ", "", address(), None), Err(CommerceError::Validation(v)) if v.violations().len() == 2));
        let err = Shipment::create(Uuid::nil(), "UPS", "1Z", Address::default(), None).unwrap_err();
        assert_eq!(err.code(), "SHIPPING_INCOMPLETE_ADDRESS");
    }

    #[test]
    fn test_tracking_updates_locations() {
        let mut s = shipped();
        assert!(!s.ship());
        s.add_tracking_update(ShipmentStatus::InTransit, Some("Oslo hub".into()), "Arrived at hub", None).unwrap();
        s.add_tracking_update(ShipmentStatus::OutForDelivery, Some("Oslo".into()), "Out for delivery", None).unwrap();
        assert_eq!(s.current_location(), Some("Oslo"));
        assert_eq!(s.last_location(), Some("Oslo hub"));
        assert_eq!(s.tracking_history().len(), 3);
        let stamps: Vec<_> = s.tracking_history().iter().map(|t| t.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_delivery_stamped_once() {
        let mut s = shipped();
        assert_eq!(s.add_tracking_update(ShipmentStatus::Delivered, None, "Left at door", None), Ok(true));
        let delivered_at = s.delivered_at();
        assert_eq!(s.add_tracking_update(ShipmentStatus::Delivered, None, "Duplicate callback", None), Ok(false));
        assert_eq!(s.delivered_at(), delivered_at);
        assert!(s.actual_delivery_date().is_some());
        assert_eq!(s.cancel().unwrap_err().kind, ShippingErrorKind::AlreadyDelivered);
    }

    #[test]
    fn test_exception_defaults_type() {
        let mut s = shipped();
        s.add_tracking_update(ShipmentStatus::Exception, None, "Storm", Some(ExceptionType::WeatherDelay)).unwrap();
        s.add_tracking_update(ShipmentStatus::Exception, None, "Unknown", None).unwrap();
        assert_eq!(s.tracking_history()[1].exception_type, Some(ExceptionType::WeatherDelay));
        assert_eq!(s.latest_tracking().and_then(|t| t.exception_type), Some(ExceptionType::Other));
    }

    #[test]
    fn test_overdue_and_transit_days() {
        let s = shipped();
        let later = Utc::now() + Duration::days(3);
        assert!(s.is_overdue(later));
        assert!(!s.is_overdue(Utc::now()));
        assert_eq!(s.days_in_transit(later), 3);
    }

    #[test]
    fn test_cancel_rules() {
        let mut pending = Shipment::create(Uuid::now_v7(), "dhl", "JD01", address(), None).unwrap();
        assert_eq!(pending.tracking_url().as_deref(), Some("https://www.dhl.com/track?AWB=JD01"));
        assert_eq!(pending.cancel(), Ok(true));
        assert_eq!(pending.cancel(), Ok(false));
        assert_eq!(pending.add_tracking_update(ShipmentStatus::InTransit, None, "late", None).unwrap_err().kind, ShippingErrorKind::ShipmentCancelled);

        let mut moving = shipped();
        assert_eq!(moving.cancel().unwrap_err().kind, ShippingErrorKind::CannotCancel);
    }
}

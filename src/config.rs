//! Service configuration, read once from the environment at startup.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use crate::domain::aggregates::{TransitionPolicy, DEFAULT_CART_TTL_DAYS, DEFAULT_MAX_RETRIES};
use crate::domain::checkout::PricingConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid { name: &'static str, value: String, reason: String },
}

/// What happens to the order once its payment has failed for the last time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentFailurePolicy {
    /// Order stays pending; someone has to act on it.
    LeavePending,
    /// Order moves to `PaymentFailed` and its stock is released.
    #[default]
    HoldOrder,
    /// Order is cancelled and its stock is released.
    CancelOrder,
}

impl FromStr for PaymentFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "leave_pending" => Ok(Self::LeavePending),
            "hold_order" => Ok(Self::HoldOrder),
            "cancel_order" => Ok(Self::CancelOrder),
            _ => Err("expected leave_pending, hold_order or cancel_order".into()),
        }
    }
}

fn parse_transition_policy(s: &str) -> Result<TransitionPolicy, String> {
    match s.trim().to_lowercase().as_str() {
        "lenient" => Ok(TransitionPolicy::Lenient),
        "strict" => Ok(TransitionPolicy::Strict),
        _ => Err("expected lenient or strict".into()),
    }
}

/// Business rules shared by every request.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    pub currency: String,
    pub pricing: PricingConfig,
    pub transition_policy: TransitionPolicy,
    pub payment_failure_policy: PaymentFailurePolicy,
    pub max_payment_retries: u32,
    pub cart_ttl_days: i64,
    /// Pending orders and payments older than this are reported as stale.
    pub pending_cutoff: Duration,
    pub default_transit_days: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            currency: "USD".into(),
            pricing: PricingConfig::default(),
            transition_policy: TransitionPolicy::default(),
            payment_failure_policy: PaymentFailurePolicy::default(),
            max_payment_retries: DEFAULT_MAX_RETRIES,
            cart_ttl_days: DEFAULT_CART_TTL_DAYS,
            pending_cutoff: Duration::hours(24),
            default_transit_days: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Absent: in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Absent: events are only logged.
    pub nats_url: Option<String>,
    pub port: u16,
    pub core: CoreConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = CoreConfig::default();

        let core = CoreConfig {
            currency: var("SHOP_CURRENCY").map(|c| c.to_uppercase()).unwrap_or(defaults.currency),
            pricing: PricingConfig {
                tax_rate: parse(&var, "SHOP_TAX_RATE")?.unwrap_or(Decimal::ZERO),
                flat_shipping: parse(&var, "SHOP_SHIPPING_FLAT")?.unwrap_or(Decimal::ZERO),
                free_shipping_threshold: parse(&var, "SHOP_FREE_SHIPPING_THRESHOLD")?,
            },
            transition_policy: match var("SHOP_TRANSITION_POLICY") {
                Some(v) => parse_transition_policy(&v).map_err(|reason| invalid("SHOP_TRANSITION_POLICY", &v, reason))?,
                None => defaults.transition_policy,
            },
            payment_failure_policy: parse(&var, "SHOP_PAYMENT_FAILURE_POLICY")?.unwrap_or(defaults.payment_failure_policy),
            max_payment_retries: parse(&var, "SHOP_MAX_PAYMENT_RETRIES")?.unwrap_or(defaults.max_payment_retries),
            cart_ttl_days: parse(&var, "SHOP_CART_TTL_DAYS")?.unwrap_or(defaults.cart_ttl_days),
            pending_cutoff: parse(&var, "SHOP_PENDING_CUTOFF_HOURS")?.map(Duration::hours).unwrap_or(defaults.pending_cutoff),
            default_transit_days: parse(&var, "SHOP_DEFAULT_TRANSIT_DAYS")?.unwrap_or(defaults.default_transit_days),
        };
        if core.pricing.tax_rate.is_sign_negative() || core.pricing.tax_rate > Decimal::ONE {
            return Err(invalid("SHOP_TAX_RATE", &core.pricing.tax_rate.to_string(), "must be a fraction between 0 and 1".into()));
        }

        Ok(Self {
            database_url: var("DATABASE_URL"),
            database_max_connections: parse(&var, "DATABASE_MAX_CONNECTIONS")?.unwrap_or(10),
            nats_url: var("NATS_URL"),
            port: parse(&var, "PORT")?.unwrap_or(8083),
            core,
        })
    }
}

fn invalid(name: &'static str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid { name, value: value.to_string(), reason }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name).map(|v| v.parse::<T>().map_err(|e| invalid(name, &v, e.to_string()))).transpose()
}

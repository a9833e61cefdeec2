//! Cart Aggregate

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::aggregates::Product;
use crate::domain::value_objects::{Money, Sku};
use crate::error::{CommerceError, Result};

pub const DEFAULT_CART_TTL_DAYS: i64 = 30;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cart {
    id: Uuid,
    customer_id: Option<String>,
    session_id: Option<String>,
    items: Vec<CartItem>,
    coupon_code: Option<String>,
    /// Discount requested by the coupon, before capping at the subtotal.
    coupon_discount: Money,
    subtotal: Money,
    discount: Money,
    total: Money,
    currency: String,
    saved: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: Uuid,
    pub name: String,
    pub sku: Sku,
    pub quantity: u32,
    /// Captured when the item was added.
    pub unit_price: Money,
    pub discount: Money,
}

impl CartItem {
    pub fn from_product(product: &Product, quantity: u32) -> Self {
        let unit_price = product.effective_price().clone();
        Self {
            product_id: product.id(), name: product.name().to_string(), sku: product.sku().clone(), quantity,
            discount: Money::zero(unit_price.currency()), unit_price,
        }
    }

    /// `unit_price * quantity - discount`, never below zero.
    pub fn line_total(&self) -> Money {
        let gross = self.unit_price.multiply(self.quantity);
        match gross.subtract(&self.discount) {
            Ok(net) if !net.is_negative() => net,
            _ => Money::zero(gross.currency()),
        }
    }
}

impl Cart {
    pub fn new(currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), customer_id: None, session_id: None, items: vec![],
            coupon_code: None, coupon_discount: Money::zero(currency), subtotal: Money::zero(currency),
            discount: Money::zero(currency), total: Money::zero(currency), currency: currency.to_uppercase(),
            saved: false, expires_at: Some(now + Duration::days(DEFAULT_CART_TTL_DAYS)), created_at: now, updated_at: now,
            version: 0,
        }
    }

    pub fn for_customer(customer_id: impl Into<String>, currency: &str) -> Self {
        let mut cart = Self::new(currency);
        cart.customer_id = Some(customer_id.into());
        cart
    }

    pub fn for_session(session_id: impl Into<String>, currency: &str) -> Self {
        let mut cart = Self::new(currency);
        cart.session_id = Some(session_id.into());
        cart
    }

    pub fn with_ttl_days(mut self, days: i64) -> Self {
        self.expires_at = Some(self.created_at + Duration::days(days));
        self
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn version(&self) -> u64 { self.version }
    pub(crate) fn set_version(&mut self, version: u64) { self.version = version; }
    pub fn customer_id(&self) -> Option<&str> { self.customer_id.as_deref() }
    pub fn session_id(&self) -> Option<&str> { self.session_id.as_deref() }
    pub fn items(&self) -> &[CartItem] { &self.items }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn coupon_code(&self) -> Option<&str> { self.coupon_code.as_deref() }
    pub fn subtotal(&self) -> &Money { &self.subtotal }
    /// Coupon discount actually applied (capped at the subtotal).
    pub fn discount(&self) -> &Money { &self.discount }
    pub fn total(&self) -> &Money { &self.total }
    pub fn item_count(&self) -> usize { self.items.len() }
    pub fn total_quantity(&self) -> u32 { self.items.iter().map(|i| i.quantity).sum() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn is_saved(&self) -> bool { self.saved }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn expires_at(&self) -> Option<DateTime<Utc>> { self.expires_at }
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool { self.expires_at.is_some_and(|at| now > at) }
    pub fn find_item(&self, product_id: Uuid) -> Option<&CartItem> { self.items.iter().find(|i| i.product_id == product_id) }

    /// Adds an item, merging quantities when the product is already present.
    /// The price captured by the first add is kept.
    pub fn add_item(&mut self, item: CartItem) -> Result<()> {
        if item.quantity == 0 { return Err(CommerceError::invalid("quantity", "quantity must be positive")); }
        if item.unit_price.currency() != self.currency {
            return Err(CommerceError::invalid("currency", format!("cart is priced in {}", self.currency)));
        }
        if let Some(existing) = self.items.iter_mut().find(|i| i.product_id == item.product_id) {
            existing.quantity = existing.quantity.checked_add(item.quantity)
                .ok_or_else(|| CommerceError::invalid("quantity", "quantity too large"))?;
        } else {
            self.items.push(item);
        }
        self.recalculate();
        Ok(())
    }

    pub fn update_quantity(&mut self, product_id: Uuid, quantity: u32) -> Result<()> {
        let item = self.items.iter_mut().find(|i| i.product_id == product_id)
            .ok_or_else(|| CommerceError::not_found("cart item", product_id))?;
        if quantity == 0 { self.items.retain(|i| i.product_id != product_id); }
        else { item.quantity = quantity; }
        self.recalculate();
        Ok(())
    }

    pub fn remove_item(&mut self, product_id: Uuid) -> Result<()> {
        let before = self.items.len();
        self.items.retain(|i| i.product_id != product_id);
        if self.items.len() == before { return Err(CommerceError::not_found("cart item", product_id)); }
        self.recalculate();
        Ok(())
    }

    pub fn set_item_discount(&mut self, product_id: Uuid, discount: Money) -> Result<()> {
        if discount.is_negative() { return Err(CommerceError::invalid("discount", "discount must not be negative")); }
        if discount.currency() != self.currency { return Err(CommerceError::invalid("currency", format!("cart is priced in {}", self.currency))); }
        let item = self.items.iter_mut().find(|i| i.product_id == product_id)
            .ok_or_else(|| CommerceError::not_found("cart item", product_id))?;
        item.discount = discount;
        self.recalculate();
        Ok(())
    }

    pub fn apply_coupon(&mut self, code: impl Into<String>, discount: Money) -> Result<()> {
        let code = code.into().trim().to_uppercase();
        if code.is_empty() { return Err(CommerceError::invalid("coupon_code", "coupon code is required")); }
        if discount.is_negative() { return Err(CommerceError::invalid("discount", "discount must not be negative")); }
        if discount.currency() != self.currency { return Err(CommerceError::invalid("currency", format!("cart is priced in {}", self.currency))); }
        self.coupon_code = Some(code);
        self.coupon_discount = discount;
        self.recalculate();
        Ok(())
    }

    pub fn remove_coupon(&mut self) {
        self.coupon_code = None;
        self.coupon_discount = Money::zero(&self.currency);
        self.recalculate();
    }

    /// Empties the cart, coupon included.
    pub fn clear(&mut self) {
        self.items.clear();
        self.coupon_code = None;
        self.coupon_discount = Money::zero(&self.currency);
        self.recalculate();
    }

    /// Saved carts never expire.
    pub fn save_for_later(&mut self) { self.saved = true; self.expires_at = None; self.touch(); }

    pub fn extend_expiry(&mut self, days: i64) {
        if self.saved { return; }
        let base = self.expires_at.unwrap_or_else(Utc::now).max(Utc::now());
        self.expires_at = Some(base + Duration::days(days));
        self.touch();
    }

    fn recalculate(&mut self) {
        let mut subtotal = Money::zero(&self.currency);
        for item in &self.items {
            subtotal = subtotal.add(&item.line_total()).unwrap_or(subtotal);
        }
        self.discount = self.coupon_discount.min(&subtotal).unwrap_or_else(|_| Money::zero(&self.currency));
        self.total = subtotal.subtract(&self.discount).unwrap_or_else(|_| subtotal.clone());
        self.subtotal = subtotal;
        self.touch();
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

//! Cart to order conversion.
//!
//! [`build_order`] is pure: it freezes the cart into an [`Order`] and computes
//! the totals once. Debiting stock and persisting happen together afterwards,
//! in the store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;
use crate::domain::aggregates::{Cart, Order, OrderLineItem, Product};
use crate::domain::value_objects::{Address, Money};
use crate::error::{CommerceError, Result, ValidationErrors};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Fraction, e.g. `0.08` for 8%.
    pub tax_rate: Decimal,
    pub flat_shipping: Decimal,
    pub free_shipping_threshold: Option<Decimal>,
}

impl PricingConfig {
    pub fn shipping_for(&self, subtotal: &Money) -> Money {
        match self.free_shipping_threshold {
            Some(threshold) if subtotal.amount() >= threshold => Money::zero(subtotal.currency()),
            _ => Money::new(self.flat_shipping, subtotal.currency()).rounded(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ShippingInfo {
    #[validate(length(min = 1, max = 100, message = "customer id is required"))]
    pub customer_id: String,
    #[validate(email(message = "email address is invalid"))]
    pub email: String,
    pub shipping_address: Address,
    /// Defaults to the shipping address.
    pub billing_address: Option<Address>,
    pub notes: Option<String>,
}

impl ShippingInfo {
    /// Collects every violation, addresses included, before failing.
    pub fn check(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();
        if let Err(e) = self.validate() { errors.merge(e.into()); }
        check_address(&mut errors, "shipping_address", &self.shipping_address);
        if let Some(billing) = &self.billing_address { check_address(&mut errors, "billing_address", billing); }
        errors.into_result()
    }
}

fn check_address(errors: &mut ValidationErrors, prefix: &str, address: &Address) {
    if let Err(e) = address.validate() {
        for v in ValidationErrors::from(e).violations() {
            errors.add(format!("{prefix}.{}", v.field), v.message.clone());
        }
    }
}

/// Freezes `cart` into a new pending order.
///
/// Every cart item must resolve to an active product in `products` with
/// enough stock on hand. The stock check here is advisory; the store repeats
/// it under lock when the order is placed.
pub fn build_order(
    cart: &Cart,
    products: &HashMap<Uuid, Product>,
    info: &ShippingInfo,
    pricing: &PricingConfig,
    now: DateTime<Utc>,
) -> Result<Order> {
    info.check()?;
    if cart.is_empty() { return Err(CommerceError::invalid("items", "cart is empty")); }
    if cart.is_expired(now) { return Err(CommerceError::invalid("cart", "cart has expired")); }
    if cart.customer_id().is_some_and(|owner| owner != info.customer_id) {
        return Err(CommerceError::invalid("customer_id", "cart belongs to another customer"));
    }

    let shipping_address = info.shipping_address.clone();
    let billing_address = info.billing_address.clone().unwrap_or_else(|| shipping_address.clone());
    let mut order = Order::create(info.customer_id.as_str(), info.email.as_str(), cart.currency(), shipping_address, billing_address);

    for item in cart.items() {
        let product = products.get(&item.product_id).ok_or_else(|| CommerceError::not_found("product", item.product_id))?;
        if !product.is_active() {
            return Err(CommerceError::invalid("items", format!("{} is no longer available", product.name())));
        }
        if !product.has_enough_stock(item.quantity) {
            return Err(CommerceError::InsufficientStock {
                product_id: product.id(),
                product_name: product.name().to_string(),
                requested: item.quantity,
                available: product.stock_quantity(),
            });
        }
        let line = OrderLineItem::snapshot(product.id(), product.name(), product.sku().clone(), product.description(), item.unit_price.clone(), item.quantity)
            .with_discount(item.discount.clone());
        let tax = line.line_total().percent_of(pricing.tax_rate);
        order.add_item(line.with_tax(tax))?;
    }

    order.apply_discount(cart.coupon_code().map(str::to_string), cart.discount().clone())?;
    let shipping = pricing.shipping_for(order.subtotal());
    order.set_shipping(shipping)?;
    order.set_customer_notes(info.notes.clone());
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::CartItem;
    use crate::domain::value_objects::Sku;

    fn usd(amount: i64) -> Money { Money::usd(Decimal::new(amount, 0)) }

    fn product(sku: &str, price: i64, stock: u32) -> Product {
        let mut p = Product::create(Sku::new(sku).unwrap(), sku, usd(price));
        p.publish().unwrap();
        p.increase_stock(stock, None).unwrap();
        p
    }

    fn info() -> ShippingInfo {
        ShippingInfo {
            customer_id: "CUST001".into(),
            email: "ada@example.com".into(),
            shipping_address: Address { name: "Ada".into(), street1: "1 Loop".into(), city: "Oslo".into(), zip: "0150".into(), country: "NO".into(), ..Default::default() },
            billing_address: None,
            notes: Some("ring twice".into()),
        }
    }

    fn setup() -> (Cart, HashMap<Uuid, Product>) {
        let (a, b) = (product("A", 10, 5), product("B", 25, 5));
        let mut cart = Cart::for_customer("CUST001", "USD");
        cart.add_item(CartItem::from_product(&a, 3)).unwrap();
        cart.add_item(CartItem::from_product(&b, 1)).unwrap();
        cart.apply_coupon("SAVE5", usd(5)).unwrap();
        (cart, HashMap::from([(a.id(), a), (b.id(), b)]))
    }

    #[test]
    fn test_cart_to_order_totals() {
        let (cart, products) = setup();
        let order = build_order(&cart, &products, &info(), &PricingConfig::default(), Utc::now()).unwrap();
        assert_eq!(order.subtotal().amount(), Decimal::new(55, 0));
        assert_eq!(order.discount().amount(), Decimal::new(5, 0));
        assert_eq!(order.total().amount(), Decimal::new(50, 0));
        assert_eq!(order.coupon_code(), Some("SAVE5"));
        assert_eq!(order.billing_address(), order.shipping_address());
        assert_eq!(order.customer_notes(), Some("ring twice"));
    }

    #[test]
    fn test_snapshot_ignores_later_price_changes() {
        let (cart, mut products) = setup();
        for p in products.values_mut() { p.update_price(usd(999)); }
        let order = build_order(&cart, &products, &info(), &PricingConfig::default(), Utc::now()).unwrap();
        assert_eq!(order.items()[0].unit_price(), &usd(10));
    }

    #[test]
    fn test_tax_and_shipping() {
        let (cart, products) = setup();
        let pricing = PricingConfig { tax_rate: Decimal::new(8, 2), flat_shipping: Decimal::new(999, 2), free_shipping_threshold: Some(Decimal::new(500, 0)) };
        let order = build_order(&cart, &products, &info(), &pricing, Utc::now()).unwrap();
        assert_eq!(order.tax().amount(), Decimal::new(440, 2));
        assert_eq!(order.shipping().amount(), Decimal::new(999, 2));
        // 55 + 4.40 + 9.99 - 5
        assert_eq!(order.total().amount(), Decimal::new(6439, 2));

        let free = PricingConfig { free_shipping_threshold: Some(Decimal::new(50, 0)), ..pricing };
        assert!(build_order(&cart, &products, &info(), &free, Utc::now()).unwrap().shipping().is_zero());
    }

    #[test]
    fn test_insufficient_stock_fails_whole_conversion() {
        let (mut cart, products) = setup();
        let first = cart.items()[0].product_id;
        cart.update_quantity(first, 6).unwrap();
        let err = build_order(&cart, &products, &info(), &PricingConfig::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, CommerceError::InsufficientStock { requested: 6, available: 5, .. }));
    }

    #[test]
    fn test_rejects_bad_input() {
        let (cart, products) = setup();
        let mut bad = info();
        bad.email = "nope".into();
        bad.shipping_address.country = "Norway".into();
        match build_order(&cart, &products, &bad, &PricingConfig::default(), Utc::now()).unwrap_err() {
            CommerceError::Validation(v) => {
                let fields: Vec<_> = v.violations().iter().map(|f| f.field.as_str()).collect();
                assert_eq!(fields, ["email", "shipping_address.country"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(build_order(&Cart::new("USD"), &products, &info(), &PricingConfig::default(), Utc::now()).is_err());
    }
}

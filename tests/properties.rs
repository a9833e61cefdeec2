use proptest::prelude::*;
use rust_decimal::Decimal;
use shopcore::domain::ledger::{reconcile, replay};
use shopcore::{Address, CommerceError, Money, Order, OrderLineItem, Product, Sku};
use uuid::Uuid;

fn usd_cents(cents: u32) -> Money { Money::usd(Decimal::new(i64::from(cents), 2)) }

proptest! {
    #[test]
    fn stock_always_matches_ledger(ops in prop::collection::vec((any::<bool>(), 1u32..20), 0..60)) {
        let mut product = Product::create(Sku::new("PROP-1").unwrap(), "Prop", usd_cents(100));
        let mut entries = Vec::new();
        for (increase, qty) in ops {
            let before = product.stock_quantity();
            let outcome = if increase { product.increase_stock(qty, None) } else { product.decrease_stock(qty, None) };
            match outcome {
                Ok(entry) => {
                    prop_assert!(entry.is_consistent());
                    entries.push(entry);
                }
                Err(e) => {
                    let is_shortage = matches!(e, CommerceError::InsufficientStock { .. });
                    prop_assert!(is_shortage);
                    prop_assert!(!increase && qty > before);
                    prop_assert_eq!(product.stock_quantity(), before);
                }
            }
        }
        prop_assert_eq!(i64::from(product.stock_quantity()), replay(&entries));
        prop_assert!(reconcile(product.stock_quantity(), &entries).is_ok());
    }

    #[test]
    fn order_total_is_sum_of_parts(
        lines in prop::collection::vec((1u32..50_000, 1u32..10, 0u32..2_000), 1..6),
        shipping in 0u32..5_000,
        discount in 0u32..200_000,
    ) {
        let mut order = Order::create("CUST", "c@example.com", "USD", Address::default(), Address::default());
        for (i, (price, qty, tax)) in lines.into_iter().enumerate() {
            let sku = Sku::new(format!("SKU-{i}")).unwrap();
            let item = OrderLineItem::snapshot(Uuid::new_v4(), "Thing", sku, "", usd_cents(price), qty).with_tax(usd_cents(tax));
            order.add_item(item).unwrap();
        }
        order.set_shipping(usd_cents(shipping)).unwrap();
        order.apply_discount(Some("PROP".into()), usd_cents(discount)).unwrap();

        let expected = order.subtotal().amount() + order.tax().amount() + order.shipping().amount() - order.discount().amount();
        prop_assert_eq!(order.total().amount(), expected);
        prop_assert!(order.discount().amount() <= order.subtotal().amount());
        prop_assert!(!order.total().is_negative());
    }
}

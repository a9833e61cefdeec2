use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use shopcore::config::{CoreConfig, PaymentFailurePolicy};
use shopcore::domain::checkout::ShippingInfo;
use shopcore::domain::events::DomainEvent;
use shopcore::domain::ledger::TransactionKind;
use shopcore::error::{PaymentErrorKind, ShippingErrorKind};
use shopcore::notify::{LogNotifier, Notifier, NotifyError};
use shopcore::service::{NewProduct, TrackingUpdate};
use shopcore::store::MemoryStore;
use shopcore::{
    Address, CommerceError, CommerceService, Order, OrderStatus, PaymentMethod, PaymentStatus, Product, ShipmentStatus,
    TransitionPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

fn service(config: CoreConfig) -> CommerceService {
    CommerceService::new(Arc::new(MemoryStore::new()), Arc::new(LogNotifier), Arc::new(config))
}

fn dec(units: i64) -> Decimal { Decimal::new(units, 0) }

fn info(customer: &str) -> ShippingInfo {
    ShippingInfo {
        customer_id: customer.into(),
        email: format!("{}@example.com", customer.to_lowercase()),
        shipping_address: Address {
            name: "Grace Hopper".into(), street1: "12 Harbor St".into(), city: "Arlington".into(), state: Some("VA".into()),
            zip: "22201".into(), country: "US".into(), ..Default::default()
        },
        billing_address: None,
        notes: None,
    }
}

async fn product(svc: &CommerceService, sku: &str, price: i64, stock: u32) -> Product {
    svc.create_product(NewProduct {
        sku: sku.into(), name: format!("Item {sku}"), description: None, price: dec(price), sale_price: None,
        reorder_point: 0, initial_stock: stock,
    })
    .await
    .unwrap()
}

/// Places an order for `qty` units of `product` on a fresh cart.
async fn checkout(svc: &CommerceService, customer: &str, product: &Product, qty: u32) -> Order {
    let cart = svc.create_cart(Some(customer.into()), None).await.unwrap();
    svc.add_to_cart(cart.id(), product.id(), qty).await.unwrap();
    svc.create_order_from_cart(cart.id(), info(customer)).await.unwrap()
}

async fn paid_order(svc: &CommerceService, product: &Product, qty: u32, tx: &str) -> Order {
    let order = checkout(svc, "CUST-PAID", product, qty).await;
    let payment = svc.record_payment(order.id(), PaymentMethod::CreditCard, order.total().amount()).await.unwrap();
    svc.complete_payment(payment.id(), tx, Some("AUTH-1".into())).await.unwrap()
}

async fn stock(svc: &CommerceService, product: &Product) -> u32 {
    svc.get_product(product.id()).await.unwrap().stock_quantity()
}

#[tokio::test]
async fn test_cart_with_coupon_becomes_order() {
    let svc = service(CoreConfig::default());
    let a = product(&svc, "A-1", 10, 10).await;
    let b = product(&svc, "B-1", 25, 10).await;
    let cart = svc.create_cart(Some("CUST001".into()), None).await.unwrap();
    svc.add_to_cart(cart.id(), a.id(), 3).await.unwrap();
    svc.add_to_cart(cart.id(), b.id(), 1).await.unwrap();
    svc.apply_coupon(cart.id(), "SAVE5", dec(5)).await.unwrap();

    let order = svc.create_order_from_cart(cart.id(), info("CUST001")).await.unwrap();
    assert_eq!(order.subtotal().amount(), dec(55));
    assert_eq!(order.discount().amount(), dec(5));
    assert_eq!(order.total().amount(), dec(50));
    assert_eq!(order.status(), OrderStatus::Pending);
    assert!(order.stock_reserved());

    assert_eq!(stock(&svc, &a).await, 7);
    let history = svc.stock_history(a.id()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].kind, TransactionKind::Reserved);
    assert_eq!(history[1].quantity_change, -3);
    assert_eq!(history[1].reference_id.as_deref(), Some(order.order_number().as_str()));
    assert!(svc.reconcile_stock(a.id()).await.unwrap().is_none());

    // cart is emptied once the order exists
    assert!(svc.get_cart(cart.id()).await.unwrap().is_empty());
    assert_eq!(svc.find_order_by_number(order.order_number().as_str()).await.unwrap().id(), order.id());
}

#[tokio::test]
async fn test_add_to_cart_checks_stock() {
    let svc = service(CoreConfig::default());
    let a = product(&svc, "A-1", 10, 4).await;
    let cart = svc.create_cart(None, Some("session-1".into())).await.unwrap();
    svc.add_to_cart(cart.id(), a.id(), 3).await.unwrap();

    let err = svc.add_to_cart(cart.id(), a.id(), 2).await.unwrap_err();
    assert!(matches!(err, CommerceError::InsufficientStock { requested: 5, available: 4, .. }));
    assert_eq!(err.user_message(), "Only 4 units of Item A-1 are available, but you requested 5");

    svc.deactivate_product(a.id()).await.unwrap();
    let err = svc.add_to_cart(cart.id(), a.id(), 1).await.unwrap_err();
    assert!(matches!(err, CommerceError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkouts_do_not_oversell() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;

    let mut carts = Vec::new();
    for customer in ["CUST-A", "CUST-B"] {
        let cart = svc.create_cart(Some(customer.into()), None).await.unwrap();
        svc.add_to_cart(cart.id(), widget.id(), 3).await.unwrap();
        carts.push((cart.id(), customer));
    }
    let handles: Vec<_> = carts
        .into_iter()
        .map(|(cart_id, customer)| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.create_order_from_cart(cart_id, info(customer)).await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles { results.push(handle.await.unwrap()); }

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let failure = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(failure, CommerceError::InsufficientStock { requested: 3, available: 2, .. }));
    assert_eq!(stock(&svc, &widget).await, 2);
    assert!(svc.reconcile_stock(widget.id()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stock_removals_serialize() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-2", 10, 5).await;
    let (first, second) = tokio::join!(
        svc.remove_stock(widget.id(), 3, Some("damaged".into())),
        svc.remove_stock(widget.id(), 3, Some("damaged".into())),
    );
    assert!(first.is_ok() != second.is_ok());
    assert_eq!(stock(&svc, &widget).await, 2);
    assert_eq!(svc.stock_history(widget.id()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_checkout_leaves_no_trace() {
    let svc = service(CoreConfig::default());
    let a = product(&svc, "A-1", 10, 5).await;
    let b = product(&svc, "B-1", 25, 1).await;
    let cart = svc.create_cart(Some("CUST001".into()), None).await.unwrap();
    svc.add_to_cart(cart.id(), a.id(), 2).await.unwrap();
    svc.add_to_cart(cart.id(), b.id(), 1).await.unwrap();
    // someone else takes the last B
    svc.remove_stock(b.id(), 1, None).await.unwrap();

    let err = svc.create_order_from_cart(cart.id(), info("CUST001")).await.unwrap_err();
    assert!(matches!(err, CommerceError::InsufficientStock { available: 0, .. }));
    assert_eq!(stock(&svc, &a).await, 5);
    assert_eq!(svc.stock_history(a.id()).await.unwrap().len(), 1);
    assert!(svc.orders_for_customer("CUST001").await.unwrap().is_empty());
    assert_eq!(svc.get_cart(cart.id()).await.unwrap().item_count(), 2);
}

#[tokio::test]
async fn test_checkout_validation_collects_every_problem() {
    let svc = service(CoreConfig::default());
    let a = product(&svc, "A-1", 10, 5).await;
    let cart = svc.create_cart(Some("CUST001".into()), None).await.unwrap();
    svc.add_to_cart(cart.id(), a.id(), 1).await.unwrap();

    let mut bad = info("CUST001");
    bad.email = "not-an-email".into();
    bad.shipping_address.city.clear();
    match svc.create_order_from_cart(cart.id(), bad).await.unwrap_err() {
        CommerceError::Validation(errors) => {
            let fields: Vec<_> = errors.violations().iter().map(|v| v.field.as_str()).collect();
            assert!(fields.contains(&"email"));
            assert!(fields.contains(&"shipping_address.city"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(stock(&svc, &a).await, 5);
}

#[tokio::test]
async fn test_cancel_paid_order_releases_stock_and_refunds() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = paid_order(&svc, &widget, 3, "tx-100").await;
    assert_eq!(order.status(), OrderStatus::Paid);
    assert_eq!(stock(&svc, &widget).await, 2);

    let cancelled = svc.cancel_order(order.id(), "customer changed mind").await.unwrap();
    assert_eq!(cancelled.status(), OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at().is_some());
    assert!(!cancelled.stock_reserved());
    assert_eq!(stock(&svc, &widget).await, 5);

    let history = svc.stock_history(widget.id()).await.unwrap();
    let release = history.last().unwrap();
    assert_eq!(release.kind, TransactionKind::Released);
    assert_eq!(release.quantity_change, 3);
    assert_eq!(release.quantity_after, 5);

    let payment = svc.payment_for_order(order.id()).await.unwrap();
    assert_eq!(payment.status(), PaymentStatus::Refunded);
    assert_eq!(payment.refund_amount(), payment.amount());

    // a second cancel changes nothing under the lenient policy
    let again = svc.cancel_order(order.id(), "twice").await.unwrap();
    assert_eq!(again.cancelled_at(), cancelled.cancelled_at());
    assert_eq!(svc.stock_history(widget.id()).await.unwrap().len(), history.len());
}

#[tokio::test]
async fn test_cancel_pending_order_cancels_open_payment() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = checkout(&svc, "CUST001", &widget, 2).await;
    let payment = svc.record_payment(order.id(), PaymentMethod::PayPal, dec(20)).await.unwrap();

    svc.cancel_order(order.id(), "out of patience").await.unwrap();
    assert_eq!(svc.get_payment(payment.id()).await.unwrap().status(), PaymentStatus::Cancelled);
    assert_eq!(stock(&svc, &widget).await, 5);
}

#[tokio::test]
async fn test_record_payment_rules() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = checkout(&svc, "CUST001", &widget, 2).await;

    let err = svc.record_payment(order.id(), PaymentMethod::CreditCard, dec(19)).await.unwrap_err();
    assert!(matches!(err, CommerceError::Validation(_)));
    svc.record_payment(order.id(), PaymentMethod::CreditCard, dec(20)).await.unwrap();
    let err = svc.record_payment(order.id(), PaymentMethod::CreditCard, dec(20)).await.unwrap_err();
    assert!(matches!(err, CommerceError::Conflict(_)));
}

#[tokio::test]
async fn test_complete_payment_is_idempotent() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 10).await;
    let order = paid_order(&svc, &widget, 1, "tx-1").await;
    let payment = svc.payment_for_order(order.id()).await.unwrap();
    assert!(payment.is_verified());

    let again = svc.complete_payment(payment.id(), "tx-1", None).await.unwrap();
    assert_eq!(again.paid_at(), order.paid_at());
    assert_eq!(again.status(), OrderStatus::Paid);

    let other = checkout(&svc, "CUST002", &widget, 1).await;
    let other_payment = svc.record_payment(other.id(), PaymentMethod::CreditCard, dec(10)).await.unwrap();
    match svc.complete_payment(other_payment.id(), "tx-1", None).await.unwrap_err() {
        CommerceError::Payment(e) => assert_eq!(e.kind, PaymentErrorKind::DuplicateTransaction),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(svc.get_order(other.id()).await.unwrap().status(), OrderStatus::Pending);
}

#[tokio::test]
async fn test_exhausted_payment_holds_order_and_releases_stock() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = checkout(&svc, "CUST001", &widget, 3).await;
    let payment = svc.record_payment(order.id(), PaymentMethod::CreditCard, dec(30)).await.unwrap();

    for attempt in 1..=3 {
        let failed = svc.fail_payment(payment.id(), "card declined").await.unwrap();
        assert_eq!(failed.retry_count(), attempt);
        if attempt < 3 {
            assert!(failed.can_retry());
            svc.retry_payment(payment.id()).await.unwrap();
        }
    }
    let payment = svc.get_payment(payment.id()).await.unwrap();
    assert!(!payment.can_retry());
    match svc.fail_payment(payment.id(), "card declined").await.unwrap_err() {
        CommerceError::Payment(e) => assert_eq!(e.kind, PaymentErrorKind::RetriesExhausted),
        other => panic!("unexpected error {other:?}"),
    }

    let held = svc.get_order(order.id()).await.unwrap();
    assert_eq!(held.status(), OrderStatus::PaymentFailed);
    assert!(!held.stock_reserved());
    assert_eq!(stock(&svc, &widget).await, 5);

    // the customer comes back with another card
    let resumed = svc.resume_order(order.id()).await.unwrap();
    assert_eq!(resumed.status(), OrderStatus::Pending);
    assert!(resumed.stock_reserved());
    assert_eq!(stock(&svc, &widget).await, 2);
    let retry = svc.record_payment(order.id(), PaymentMethod::PayPal, dec(30)).await.unwrap();
    let paid = svc.complete_payment(retry.id(), "tx-retry", None).await.unwrap();
    assert_eq!(paid.status(), OrderStatus::Paid);
}

#[tokio::test]
async fn test_exhausted_payment_policies() {
    for (policy, expected, restored) in [
        (PaymentFailurePolicy::CancelOrder, OrderStatus::Cancelled, true),
        (PaymentFailurePolicy::LeavePending, OrderStatus::Pending, false),
    ] {
        let svc = service(CoreConfig { payment_failure_policy: policy, max_payment_retries: 1, ..CoreConfig::default() });
        let widget = product(&svc, "W-1", 10, 5).await;
        let order = checkout(&svc, "CUST001", &widget, 3).await;
        let payment = svc.record_payment(order.id(), PaymentMethod::CreditCard, dec(30)).await.unwrap();
        svc.fail_payment(payment.id(), "gateway timeout").await.unwrap();

        assert_eq!(svc.get_order(order.id()).await.unwrap().status(), expected);
        assert_eq!(stock(&svc, &widget).await, if restored { 5 } else { 2 });
    }
}

#[tokio::test]
async fn test_ship_track_and_deliver() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = paid_order(&svc, &widget, 2, "tx-7").await;
    svc.mark_processing(order.id()).await.unwrap();

    let shipment = svc.ship_order(order.id(), "UPS", "1Z999AA10123456784").await.unwrap();
    assert_eq!(shipment.status(), ShipmentStatus::Shipped);
    assert!(shipment.estimated_delivery_date().is_some());
    assert_eq!(svc.get_order(order.id()).await.unwrap().status(), OrderStatus::Shipped);
    // shipping twice hands back the same shipment
    assert_eq!(svc.ship_order(order.id(), "UPS", "1Z999AA10123456784").await.unwrap().id(), shipment.id());

    let update = |status, location: &str| TrackingUpdate {
        status, location: Some(location.into()), description: format!("{location} scan"), exception_type: None,
    };
    svc.record_tracking_event(shipment.id(), update(ShipmentStatus::InTransit, "Louisville")).await.unwrap();
    let delivered = svc.record_tracking_event(shipment.id(), update(ShipmentStatus::Delivered, "Arlington")).await.unwrap();
    let order_after = svc.get_order(order.id()).await.unwrap();
    assert_eq!(order_after.status(), OrderStatus::Delivered);

    let again = svc.record_tracking_event(shipment.id(), update(ShipmentStatus::Delivered, "Arlington")).await.unwrap();
    assert_eq!(again.delivered_at(), delivered.delivered_at());
    assert_eq!(again.tracking_history().len(), 4);
    assert_eq!(svc.get_order(order.id()).await.unwrap().delivered_at(), order_after.delivered_at());
}

#[tokio::test]
async fn test_tracking_numbers_are_unique() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let first = paid_order(&svc, &widget, 1, "tx-1").await;
    let second = paid_order(&svc, &widget, 1, "tx-2").await;
    svc.ship_order(first.id(), "DHL", "JD0001").await.unwrap();

    match svc.ship_order(second.id(), "DHL", "JD0001").await.unwrap_err() {
        CommerceError::Shipping(e) => assert_eq!(e.kind, ShippingErrorKind::DuplicateTrackingNumber),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(svc.get_order(second.id()).await.unwrap().status(), OrderStatus::Paid);

    let err = svc.cancel_order(first.id(), "too late").await;
    assert_eq!(err.unwrap().status(), OrderStatus::Shipped);
}

#[tokio::test]
async fn test_return_then_refund_in_two_parts() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = paid_order(&svc, &widget, 2, "tx-9").await;
    let shipment = svc.ship_order(order.id(), "USPS", "9400100000000000000000").await.unwrap();
    svc.record_tracking_event(shipment.id(), TrackingUpdate {
        status: ShipmentStatus::Delivered, location: None, description: "Left at door".into(), exception_type: None,
    })
    .await
    .unwrap();

    let returned = svc.return_order(order.id(), "wrong size").await.unwrap();
    assert_eq!(returned.status(), OrderStatus::Returned);
    assert_eq!(stock(&svc, &widget).await, 5);
    assert_eq!(svc.stock_history(widget.id()).await.unwrap().last().unwrap().kind, TransactionKind::StockIn);

    let payment = svc.payment_for_order(order.id()).await.unwrap();
    let partial = svc.refund_payment(payment.id(), dec(5), "restocking fee withheld").await.unwrap();
    assert_eq!(partial.status(), PaymentStatus::PartiallyRefunded);
    assert!(partial.is_partial_refund());
    assert_eq!(svc.get_order(order.id()).await.unwrap().status(), OrderStatus::Returned);

    let err = svc.refund_payment(payment.id(), dec(16), "too much").await.unwrap_err();
    assert!(matches!(err, CommerceError::Validation(_)));
    assert_eq!(svc.get_payment(payment.id()).await.unwrap().refund_amount().amount(), dec(5));

    let full = svc.refund_payment(payment.id(), dec(15), "rest of it").await.unwrap();
    assert_eq!(full.status(), PaymentStatus::Refunded);
    assert_eq!(svc.get_order(order.id()).await.unwrap().status(), OrderStatus::Refunded);
}

#[tokio::test]
async fn test_transition_policy() {
    let lenient = service(CoreConfig::default());
    let widget = product(&lenient, "W-1", 10, 5).await;
    let order = checkout(&lenient, "CUST001", &widget, 1).await;
    assert_eq!(lenient.mark_processing(order.id()).await.unwrap().status(), OrderStatus::Pending);

    let strict = service(CoreConfig { transition_policy: TransitionPolicy::Strict, ..CoreConfig::default() });
    let widget = product(&strict, "W-1", 10, 5).await;
    let order = checkout(&strict, "CUST001", &widget, 1).await;
    match strict.mark_processing(order.id()).await.unwrap_err() {
        CommerceError::InvalidOrderStatusTransition(t) => {
            assert_eq!(t.current, OrderStatus::Pending);
            assert_eq!(t.attempted, OrderStatus::Processing);
            assert!(t.valid_targets.contains(&OrderStatus::Paid));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_hold_and_stale_reports() {
    let svc = service(CoreConfig::default());
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = checkout(&svc, "CUST001", &widget, 1).await;

    assert!(svc.stale_pending_orders(Utc::now()).await.unwrap().is_empty());
    let later = Utc::now() + Duration::days(2);
    assert_eq!(svc.stale_pending_orders(later).await.unwrap().len(), 1);

    let held = svc.hold_order(order.id(), "fraud review").await.unwrap();
    assert_eq!(held.status(), OrderStatus::OnHold);
    assert!(held.stock_reserved());
    assert!(svc.stale_pending_orders(later).await.unwrap().is_empty());
    assert_eq!(svc.resume_order(order.id()).await.unwrap().status(), OrderStatus::Pending);
    assert_eq!(stock(&svc, &widget).await, 4);
}

#[tokio::test]
async fn test_stock_maintenance() {
    let svc = service(CoreConfig::default());
    let widget = svc
        .create_product(NewProduct {
            sku: "w-9".into(), name: "Widget".into(), description: Some("Blue".into()), price: dec(4), sale_price: Some(dec(3)),
            reorder_point: 5, initial_stock: 20,
        })
        .await
        .unwrap();
    assert_eq!(widget.sku().as_str(), "W-9");
    assert_eq!(widget.effective_price().amount(), dec(3));

    svc.adjust_stock(widget.id(), -2, "water damage").await.unwrap();
    assert!(svc.products_needing_reorder().await.unwrap().is_empty());
    let counted = svc.cycle_count(widget.id(), 4, Some("COUNT-7".into())).await.unwrap();
    assert_eq!(counted.stock_quantity(), 4);
    assert_eq!(svc.products_needing_reorder().await.unwrap().len(), 1);

    let kinds: Vec<_> = svc.stock_history(widget.id()).await.unwrap().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [TransactionKind::StockIn, TransactionKind::Adjustment, TransactionKind::CycleCount]);
    assert!(svc.reconcile_stock(widget.id()).await.unwrap().is_none());

    let err = svc.create_product(NewProduct {
        sku: "W-9".into(), name: "Copy".into(), description: None, price: dec(1), sale_price: None, reorder_point: 0, initial_stock: 0,
    })
    .await
    .unwrap_err();
    assert!(matches!(err, CommerceError::Conflict(_)));
    assert!(matches!(svc.restock(Uuid::new_v4(), 1, None).await, Err(CommerceError::NotFound { .. })));
}

struct CountingNotifier {
    seen: AtomicUsize,
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn notify(&self, _: &DomainEvent) -> Result<(), NotifyError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Publish("broker unreachable".into()))
    }
}

#[tokio::test]
async fn test_notifier_failure_does_not_undo_transitions() {
    let notifier = Arc::new(CountingNotifier { seen: AtomicUsize::new(0) });
    let svc = CommerceService::new(Arc::new(MemoryStore::new()), notifier.clone(), Arc::new(CoreConfig::default()));
    let widget = product(&svc, "W-1", 10, 5).await;
    let order = paid_order(&svc, &widget, 1, "tx-1").await;

    assert_eq!(svc.get_order(order.id()).await.unwrap().status(), OrderStatus::Paid);
    assert!(notifier.seen.load(Ordering::SeqCst) >= 3);
}

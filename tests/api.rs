use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use shopcore::notify::LogNotifier;
use shopcore::store::MemoryStore;
use shopcore::{api, CommerceService, CoreConfig};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    let service = CommerceService::new(Arc::new(MemoryStore::new()), Arc::new(LogNotifier), Arc::new(CoreConfig::default()));
    api::router(service)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, json)
}

fn amount(money: &Value) -> Decimal { money["amount"].as_str().unwrap().parse().unwrap() }

fn shipping_info() -> Value {
    json!({
        "customer_id": "CUST001",
        "email": "ada@example.com",
        "shipping_address": { "name": "Ada", "street1": "1 Loop", "city": "Oslo", "zip": "0150", "country": "NO" },
    })
}

async fn create_product(app: &Router, sku: &str, stock: u32) -> String {
    let (status, product) = send(app, Method::POST, "/api/v1/products", Some(json!({
        "sku": sku, "name": "Lamp", "price": "10.00", "initial_stock": stock,
    })))
    .await;
    assert_eq!(status, StatusCode::CREATED);
    product["id"].as_str().unwrap().to_string()
}

async fn cart_with(app: &Router, product_id: &str, quantity: u32) -> String {
    let (_, cart) = send(app, Method::POST, "/api/v1/carts", Some(json!({ "customer_id": "CUST001" }))).await;
    let cart_id = cart["id"].as_str().unwrap().to_string();
    let (status, _) = send(app, Method::POST, &format!("/api/v1/carts/{cart_id}/items"), Some(json!({
        "product_id": product_id, "quantity": quantity,
    })))
    .await;
    assert_eq!(status, StatusCode::OK);
    cart_id
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(&app(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_checkout_and_pay_over_http() {
    let app = app();
    let product_id = create_product(&app, "LAMP-1", 5).await;
    let cart_id = cart_with(&app, &product_id, 3).await;

    let (status, order) = send(&app, Method::POST, &format!("/api/v1/carts/{cart_id}/checkout"), Some(shipping_info())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "pending");
    assert_eq!(amount(&order["total"]), Decimal::new(30, 0));
    let order_id = order["id"].as_str().unwrap();

    let (status, payment) = send(&app, Method::POST, &format!("/api/v1/orders/{order_id}/payments"), Some(json!({
        "method": "credit_card", "amount": "30",
    })))
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let payment_id = payment["id"].as_str().unwrap();

    let (status, paid) = send(&app, Method::POST, &format!("/api/v1/payments/{payment_id}/complete"), Some(json!({
        "transaction_id": "ch_123",
    })))
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["status"], "paid");

    let (_, history) = send(&app, Method::GET, &format!("/api/v1/products/{product_id}/stock/history"), None).await;
    let kinds: Vec<_> = history.as_array().unwrap().iter().map(|e| e["kind"].as_str().unwrap().to_string()).collect();
    assert_eq!(kinds, ["stock_in", "reserved"]);
    let (_, report) = send(&app, Method::GET, &format!("/api/v1/products/{product_id}/stock/reconcile"), None).await;
    assert_eq!(report["consistent"], true);
}

#[tokio::test]
async fn test_errors_carry_code_and_message() {
    let app = app();
    let product_id = create_product(&app, "LAMP-2", 2).await;

    let (_, cart) = send(&app, Method::POST, "/api/v1/carts", Some(json!({ "session_id": "anon-1" }))).await;
    let cart_id = cart["id"].as_str().unwrap();
    let (status, body) = send(&app, Method::POST, &format!("/api/v1/carts/{cart_id}/items"), Some(json!({
        "product_id": product_id, "quantity": 3,
    })))
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INSUFFICIENT_STOCK");
    assert_eq!(body["message"], "Only 2 units of Lamp are available, but you requested 3");

    let (status, body) = send(&app, Method::GET, "/api/v1/orders/00000000-0000-0000-0000-000000000000", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "RESOURCE_NOT_FOUND");

    let (status, body) = send(&app, Method::POST, &format!("/api/v1/products/{product_id}/stock"), Some(json!({
        "action": "adjust", "delta": 4, "reason": " ",
    })))
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_cancel_releases_stock_over_http() {
    let app = app();
    let product_id = create_product(&app, "LAMP-3", 4).await;
    let cart_id = cart_with(&app, &product_id, 4).await;
    let (_, order) = send(&app, Method::POST, &format!("/api/v1/carts/{cart_id}/checkout"), Some(shipping_info())).await;
    let order_id = order["id"].as_str().unwrap();

    let (_, product) = send(&app, Method::GET, &format!("/api/v1/products/{product_id}"), None).await;
    assert_eq!(product["stock_quantity"], 0);

    let (status, cancelled) = send(&app, Method::POST, &format!("/api/v1/orders/{order_id}/cancel"), Some(json!({ "reason": "duplicate" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    let (_, product) = send(&app, Method::GET, &format!("/api/v1/products/{product_id}"), None).await;
    assert_eq!(product["stock_quantity"], 4);
}

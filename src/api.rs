//! HTTP surface over [`CommerceService`].

use axum::{extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, routing::{get, post, put}, Json, Router};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;
use crate::domain::aggregates::{Cart, Order, Payment, PaymentMethod, Product, Shipment};
use crate::domain::checkout::ShippingInfo;
use crate::domain::ledger::StockLedgerEntry;
use crate::error::CommerceError;
use crate::service::{CommerceService, NewProduct, TrackingUpdate};

type ApiResult<T> = Result<Json<T>, CommerceError>;
type Created<T> = Result<(StatusCode, Json<T>), CommerceError>;

impl IntoResponse for CommerceError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() { error!(error = %self, "request failed"); }
        (status, Json(json!({ "code": self.code(), "message": self.user_message() }))).into_response()
    }
}

pub fn router(service: CommerceService) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "shopcore"})) }))
        .route("/api/v1/products", post(create_product))
        .route("/api/v1/products/:id", get(get_product).delete(deactivate_product))
        .route("/api/v1/products/:id/stock", post(move_stock))
        .route("/api/v1/products/:id/stock/history", get(stock_history))
        .route("/api/v1/products/:id/stock/reconcile", get(reconcile_stock))
        .route("/api/v1/carts", post(create_cart))
        .route("/api/v1/carts/:id", get(get_cart))
        .route("/api/v1/carts/:id/items", post(add_to_cart))
        .route("/api/v1/carts/:id/items/:product_id", put(update_cart_item).delete(remove_from_cart))
        .route("/api/v1/carts/:id/coupon", post(apply_coupon))
        .route("/api/v1/carts/:id/save", post(save_cart))
        .route("/api/v1/carts/:id/checkout", post(checkout))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/payments", post(record_payment))
        .route("/api/v1/orders/:id/processing", post(mark_processing))
        .route("/api/v1/orders/:id/ship", post(ship_order))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/orders/:id/hold", post(hold_order))
        .route("/api/v1/orders/:id/resume", post(resume_order))
        .route("/api/v1/orders/:id/return", post(return_order))
        .route("/api/v1/customers/:customer_id/orders", get(customer_orders))
        .route("/api/v1/payments/:id", get(get_payment))
        .route("/api/v1/payments/:id/complete", post(complete_payment))
        .route("/api/v1/payments/:id/fail", post(fail_payment))
        .route("/api/v1/payments/:id/retry", post(retry_payment))
        .route("/api/v1/payments/:id/refund", post(refund_payment))
        .route("/api/v1/payments/:id/cancel", post(cancel_payment))
        .route("/api/v1/shipments/:id", get(get_shipment))
        .route("/api/v1/shipments/:id/tracking", post(record_tracking))
        .route("/api/v1/reports/reorder", get(reorder_report))
        .route("/api/v1/reports/stale-orders", get(stale_orders))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StockRequest {
    Receive { quantity: u32, reference: Option<String> },
    Remove { quantity: u32, reference: Option<String> },
    Adjust { delta: i64, reason: String },
    Count { counted: u32, reference: Option<String> },
}

#[derive(Debug, Deserialize)] pub struct CreateCartRequest { pub customer_id: Option<String>, pub session_id: Option<String> }
#[derive(Debug, Deserialize)] pub struct AddItemRequest { pub product_id: Uuid, pub quantity: u32 }
#[derive(Debug, Deserialize)] pub struct QuantityRequest { pub quantity: u32 }
#[derive(Debug, Deserialize)] pub struct CouponRequest { pub code: String, pub discount: Decimal }
#[derive(Debug, Deserialize)] pub struct PaymentRequest { pub method: PaymentMethod, pub amount: Decimal }
#[derive(Debug, Deserialize)] pub struct CompletePaymentRequest { pub transaction_id: String, pub authorization_code: Option<String> }
#[derive(Debug, Deserialize)] pub struct RefundRequest { pub amount: Decimal, pub reason: String }
#[derive(Debug, Deserialize)] pub struct ReasonRequest { #[serde(default)] pub reason: String }
#[derive(Debug, Deserialize)] pub struct ShipRequest { pub carrier: String, pub tracking_number: String }

async fn create_product(State(s): State<CommerceService>, Json(r): Json<NewProduct>) -> Created<Product> {
    Ok((StatusCode::CREATED, Json(s.create_product(r).await?)))
}

async fn get_product(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Product> { Ok(Json(s.get_product(id).await?)) }

async fn deactivate_product(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Product> {
    Ok(Json(s.deactivate_product(id).await?))
}

async fn move_stock(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<StockRequest>) -> ApiResult<Product> {
    let product = match r {
        StockRequest::Receive { quantity, reference } => s.restock(id, quantity, reference).await?,
        StockRequest::Remove { quantity, reference } => s.remove_stock(id, quantity, reference).await?,
        StockRequest::Adjust { delta, reason } => s.adjust_stock(id, delta, &reason).await?,
        StockRequest::Count { counted, reference } => s.cycle_count(id, counted, reference).await?,
    };
    Ok(Json(product))
}

async fn stock_history(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Vec<StockLedgerEntry>> {
    Ok(Json(s.stock_history(id).await?))
}

async fn reconcile_stock(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<serde_json::Value> {
    let drift = s.reconcile_stock(id).await?;
    Ok(Json(json!({ "consistent": drift.is_none(), "drift": drift.map(|d| d.to_string()) })))
}

async fn create_cart(State(s): State<CommerceService>, Json(r): Json<CreateCartRequest>) -> Created<Cart> {
    Ok((StatusCode::CREATED, Json(s.create_cart(r.customer_id, r.session_id).await?)))
}

async fn get_cart(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Cart> { Ok(Json(s.get_cart(id).await?)) }

async fn add_to_cart(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<AddItemRequest>) -> ApiResult<Cart> {
    Ok(Json(s.add_to_cart(id, r.product_id, r.quantity).await?))
}

async fn update_cart_item(State(s): State<CommerceService>, Path((id, product_id)): Path<(Uuid, Uuid)>, Json(r): Json<QuantityRequest>) -> ApiResult<Cart> {
    Ok(Json(s.update_cart_item(id, product_id, r.quantity).await?))
}

async fn remove_from_cart(State(s): State<CommerceService>, Path((id, product_id)): Path<(Uuid, Uuid)>) -> ApiResult<Cart> {
    Ok(Json(s.remove_from_cart(id, product_id).await?))
}

async fn apply_coupon(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<CouponRequest>) -> ApiResult<Cart> {
    Ok(Json(s.apply_coupon(id, &r.code, r.discount).await?))
}

async fn save_cart(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Cart> { Ok(Json(s.save_cart_for_later(id).await?)) }

async fn checkout(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(info): Json<ShippingInfo>) -> Created<Order> {
    Ok((StatusCode::CREATED, Json(s.create_order_from_cart(id, info).await?)))
}

async fn get_order(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Order> { Ok(Json(s.get_order(id).await?)) }

async fn customer_orders(State(s): State<CommerceService>, Path(customer_id): Path<String>) -> ApiResult<Vec<Order>> {
    Ok(Json(s.orders_for_customer(&customer_id).await?))
}

async fn record_payment(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<PaymentRequest>) -> Created<Payment> {
    Ok((StatusCode::CREATED, Json(s.record_payment(id, r.method, r.amount).await?)))
}

async fn mark_processing(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Order> { Ok(Json(s.mark_processing(id).await?)) }

async fn ship_order(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<ShipRequest>) -> Created<Shipment> {
    Ok((StatusCode::CREATED, Json(s.ship_order(id, &r.carrier, &r.tracking_number).await?)))
}

async fn cancel_order(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<ReasonRequest>) -> ApiResult<Order> {
    Ok(Json(s.cancel_order(id, &r.reason).await?))
}

async fn hold_order(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<ReasonRequest>) -> ApiResult<Order> {
    Ok(Json(s.hold_order(id, &r.reason).await?))
}

async fn resume_order(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Order> { Ok(Json(s.resume_order(id).await?)) }

async fn return_order(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<ReasonRequest>) -> ApiResult<Order> {
    Ok(Json(s.return_order(id, &r.reason).await?))
}

async fn get_payment(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Payment> { Ok(Json(s.get_payment(id).await?)) }

async fn complete_payment(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<CompletePaymentRequest>) -> ApiResult<Order> {
    Ok(Json(s.complete_payment(id, &r.transaction_id, r.authorization_code).await?))
}

async fn fail_payment(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<ReasonRequest>) -> ApiResult<Payment> {
    Ok(Json(s.fail_payment(id, &r.reason).await?))
}

async fn retry_payment(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Payment> { Ok(Json(s.retry_payment(id).await?)) }

async fn refund_payment(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<RefundRequest>) -> ApiResult<Payment> {
    Ok(Json(s.refund_payment(id, r.amount, &r.reason).await?))
}

async fn cancel_payment(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<ReasonRequest>) -> ApiResult<Payment> {
    Ok(Json(s.cancel_payment(id, &r.reason).await?))
}

async fn get_shipment(State(s): State<CommerceService>, Path(id): Path<Uuid>) -> ApiResult<Shipment> { Ok(Json(s.get_shipment(id).await?)) }

async fn record_tracking(State(s): State<CommerceService>, Path(id): Path<Uuid>, Json(r): Json<TrackingUpdate>) -> ApiResult<Shipment> {
    Ok(Json(s.record_tracking_event(id, r).await?))
}

async fn reorder_report(State(s): State<CommerceService>) -> ApiResult<Vec<Product>> { Ok(Json(s.products_needing_reorder().await?)) }

async fn stale_orders(State(s): State<CommerceService>) -> ApiResult<Vec<Order>> { Ok(Json(s.stale_pending_orders(Utc::now()).await?)) }

//! Product Aggregate (catalog item)
//!
//! Stock only ever changes through the methods below, each of which returns
//! the [`StockLedgerEntry`] describing the change. A failed operation leaves
//! the quantity untouched and produces no entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::events::{DomainEvent, ProductEvent};
use crate::domain::ledger::{StockLedgerEntry, TransactionKind};
use crate::domain::value_objects::{Money, Sku};
use crate::error::{CommerceError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Product {
    id: Uuid,
    sku: Sku,
    name: String,
    description: String,
    price: Money,
    sale_price: Option<Money>,
    stock_quantity: u32,
    reorder_point: u32,
    status: ProductStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    events: Vec<DomainEvent>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus { #[default] Draft, Active, Archived }

impl Product {
    /// New products start as drafts with no stock; stock arrives through
    /// [`increase_stock`](Self::increase_stock) so the ledger covers it.
    pub fn create(sku: Sku, name: impl Into<String>, price: Money) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), sku, name: name.into(), description: String::new(),
            price, sale_price: None, stock_quantity: 0, reorder_point: 0,
            status: ProductStatus::Draft, created_at: now, updated_at: now, events: vec![],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self { self.description = description.into(); self }
    pub fn with_reorder_point(mut self, reorder_point: u32) -> Self { self.reorder_point = reorder_point; self }

    pub fn id(&self) -> Uuid { self.id }
    pub fn sku(&self) -> &Sku { &self.sku }
    pub fn name(&self) -> &str { &self.name }
    pub fn description(&self) -> &str { &self.description }
    pub fn price(&self) -> &Money { &self.price }
    pub fn sale_price(&self) -> Option<&Money> { self.sale_price.as_ref() }
    pub fn stock_quantity(&self) -> u32 { self.stock_quantity }
    pub fn reorder_point(&self) -> u32 { self.reorder_point }
    pub fn status(&self) -> ProductStatus { self.status }
    pub fn is_active(&self) -> bool { self.status == ProductStatus::Active }
    pub fn is_in_stock(&self) -> bool { self.stock_quantity > 0 }

    pub fn is_on_sale(&self) -> bool {
        self.sale_price.as_ref().is_some_and(|s| s.currency() == self.price.currency() && s.amount() < self.price.amount())
    }

    /// Price a shopper pays right now.
    pub fn effective_price(&self) -> &Money {
        match &self.sale_price {
            Some(sale) if self.is_on_sale() => sale,
            _ => &self.price,
        }
    }

    pub fn has_enough_stock(&self, qty: u32) -> bool { self.stock_quantity >= qty }
    pub fn is_low_stock(&self) -> bool { self.stock_quantity <= self.reorder_point }
    pub fn needs_reorder(&self) -> bool { self.is_low_stock() && self.is_active() }

    pub fn publish(&mut self) -> Result<()> {
        if self.name.trim().is_empty() { return Err(CommerceError::invalid("name", "product name is required")); }
        self.status = ProductStatus::Active;
        self.touch();
        Ok(())
    }

    /// Soft delete. Line items keep referencing the product.
    pub fn deactivate(&mut self) {
        if self.status == ProductStatus::Archived { return; }
        self.status = ProductStatus::Archived;
        self.touch();
        self.raise_event(DomainEvent::Product(ProductEvent::Deactivated { product_id: self.id }));
    }

    pub fn update_price(&mut self, new_price: Money) {
        self.price = new_price;
        self.touch();
    }

    pub fn set_sale_price(&mut self, sale_price: Option<Money>) {
        self.sale_price = sale_price;
        self.touch();
    }

    pub fn set_reorder_point(&mut self, reorder_point: u32) {
        self.reorder_point = reorder_point;
        self.touch();
    }

    pub fn increase_stock(&mut self, qty: u32, reference: Option<&str>) -> Result<StockLedgerEntry> {
        self.credit(qty, TransactionKind::StockIn, reference, None)
    }

    pub fn decrease_stock(&mut self, qty: u32, reference: Option<&str>) -> Result<StockLedgerEntry> {
        self.debit(qty, TransactionKind::StockOut, reference, None)
    }

    /// Checkout debit. Stock leaves immediately; there is no separate commit.
    pub fn reserve_stock(&mut self, qty: u32, order_reference: &str) -> Result<StockLedgerEntry> {
        self.debit(qty, TransactionKind::Reserved, Some(order_reference), None)
    }

    /// Compensating credit for an earlier reservation.
    pub fn release_stock(&mut self, qty: u32, order_reference: &str) -> Result<StockLedgerEntry> {
        self.credit(qty, TransactionKind::Released, Some(order_reference), None)
    }

    /// Manual correction by a signed delta.
    pub fn adjust_stock(&mut self, delta: i64, reason: &str) -> Result<StockLedgerEntry> {
        if delta == 0 { return Err(CommerceError::invalid("quantity", "adjustment must not be zero")); }
        if reason.trim().is_empty() { return Err(CommerceError::invalid("reason", "adjustment reason is required")); }
        let before = self.stock_quantity;
        let target = i64::from(before) + delta;
        let after = u32::try_from(target).map_err(|_| self.insufficient(delta.unsigned_abs()))?;
        Ok(self.apply(TransactionKind::Adjustment, after, None, Some(reason)))
    }

    /// Replace the booked quantity with a physical count.
    pub fn count_stock(&mut self, counted: u32, reference: Option<&str>) -> StockLedgerEntry {
        self.apply(TransactionKind::CycleCount, counted, reference, None)
    }

    fn debit(&mut self, qty: u32, kind: TransactionKind, reference: Option<&str>, reason: Option<&str>) -> Result<StockLedgerEntry> {
        if qty == 0 { return Err(CommerceError::invalid("quantity", "quantity must be positive")); }
        if !self.has_enough_stock(qty) { return Err(self.insufficient(u64::from(qty))); }
        Ok(self.apply(kind, self.stock_quantity - qty, reference, reason))
    }

    fn credit(&mut self, qty: u32, kind: TransactionKind, reference: Option<&str>, reason: Option<&str>) -> Result<StockLedgerEntry> {
        if qty == 0 { return Err(CommerceError::invalid("quantity", "quantity must be positive")); }
        let after = self.stock_quantity.checked_add(qty).ok_or_else(|| CommerceError::invalid("quantity", "stock quantity overflow"))?;
        Ok(self.apply(kind, after, reference, reason))
    }

    fn apply(&mut self, kind: TransactionKind, after: u32, reference: Option<&str>, reason: Option<&str>) -> StockLedgerEntry {
        let before = self.stock_quantity;
        let was_low = self.is_low_stock();
        self.stock_quantity = after;
        self.touch();
        let entry = StockLedgerEntry::record(self.id, kind, before, after, reference.map(str::to_string), reason.map(str::to_string));
        self.raise_event(DomainEvent::Product(ProductEvent::StockChanged {
            product_id: self.id, kind, quantity_change: entry.quantity_change, quantity_after: after,
        }));
        if !was_low && self.needs_reorder() {
            self.raise_event(DomainEvent::Product(ProductEvent::ReorderPointReached {
                product_id: self.id, sku: self.sku.to_string(), stock_quantity: after, reorder_point: self.reorder_point,
            }));
        }
        entry
    }

    fn insufficient(&self, requested: u64) -> CommerceError {
        CommerceError::InsufficientStock {
            product_id: self.id,
            product_name: self.name.clone(),
            requested: u32::try_from(requested).unwrap_or(u32::MAX),
            available: self.stock_quantity,
        }
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

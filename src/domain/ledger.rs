//! Stock ledger: the append-only record of every stock quantity change.
//!
//! A product's cached `stock_quantity` is a convenience; the ledger is the
//! source of truth. [`replay`] folds a product's entries back into a quantity
//! and [`reconcile`] reports any drift between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Goods received (restock, customer return).
    StockIn,
    /// Goods removed outside of an order (damage, write-off).
    StockOut,
    /// Manual correction by a signed delta.
    Adjustment,
    /// Debited at checkout for an order.
    Reserved,
    /// Compensating credit for a reservation (cancellation, failed payment).
    Released,
    /// Physical count replacing the booked quantity.
    CycleCount,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::StockIn => "stock_in",
            TransactionKind::StockOut => "stock_out",
            TransactionKind::Adjustment => "adjustment",
            TransactionKind::Reserved => "reserved",
            TransactionKind::Released => "released",
            TransactionKind::CycleCount => "cycle_count",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stock_in" => Some(TransactionKind::StockIn),
            "stock_out" => Some(TransactionKind::StockOut),
            "adjustment" => Some(TransactionKind::Adjustment),
            "reserved" => Some(TransactionKind::Reserved),
            "released" => Some(TransactionKind::Released),
            "cycle_count" => Some(TransactionKind::CycleCount),
            _ => None,
        }
    }
}

/// One immutable ledger row. Created once per stock mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLedgerEntry {
    pub id: Uuid,
    pub product_id: Uuid,
    pub kind: TransactionKind,
    pub quantity_before: u32,
    pub quantity_after: u32,
    pub quantity_change: i64,
    /// Order number, restock batch, count sheet...
    pub reference_id: Option<String>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StockLedgerEntry {
    pub(crate) fn record(
        product_id: Uuid,
        kind: TransactionKind,
        quantity_before: u32,
        quantity_after: u32,
        reference_id: Option<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            product_id,
            kind,
            quantity_before,
            quantity_after,
            quantity_change: i64::from(quantity_after) - i64::from(quantity_before),
            reference_id,
            reason,
            recorded_at: Utc::now(),
        }
    }

    /// `quantity_after == quantity_before + quantity_change`
    pub fn is_consistent(&self) -> bool {
        i64::from(self.quantity_before) + self.quantity_change == i64::from(self.quantity_after)
    }
}

/// Sum of quantity changes, i.e. the stock level the ledger implies.
pub fn replay<'a>(entries: impl IntoIterator<Item = &'a StockLedgerEntry>) -> i64 {
    entries.into_iter().map(|e| e.quantity_change).sum()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerDrift {
    #[error("entry {entry_id} does not add up ({before} + {change} != {after})")]
    InconsistentEntry { entry_id: Uuid, before: u32, change: i64, after: u32 },
    #[error("entry {entry_id} starts at {actual}, previous entry ended at {expected}")]
    BrokenChain { entry_id: Uuid, expected: u32, actual: u32 },
    #[error("ledger implies {ledger} units, product counter says {counter}")]
    CounterMismatch { ledger: i64, counter: u32 },
}

/// Checks a product's entries (in append order) against its cached counter.
pub fn reconcile(stock_quantity: u32, entries: &[StockLedgerEntry]) -> Result<(), LedgerDrift> {
    let mut expected_before = 0u32;
    for entry in entries {
        if !entry.is_consistent() {
            return Err(LedgerDrift::InconsistentEntry {
                entry_id: entry.id,
                before: entry.quantity_before,
                change: entry.quantity_change,
                after: entry.quantity_after,
            });
        }
        if entry.quantity_before != expected_before {
            return Err(LedgerDrift::BrokenChain { entry_id: entry.id, expected: expected_before, actual: entry.quantity_before });
        }
        expected_before = entry.quantity_after;
    }
    let ledger = replay(entries);
    if ledger != i64::from(stock_quantity) {
        return Err(LedgerDrift::CounterMismatch { ledger, counter: stock_quantity });
    }
    Ok(())
}

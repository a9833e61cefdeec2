//! Domain layer: aggregates, value objects, the stock ledger and events.
pub mod aggregates;
pub mod checkout;
pub mod events;
pub mod ledger;
pub mod value_objects;

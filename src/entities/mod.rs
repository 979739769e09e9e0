pub mod consuming_entity;
pub mod stock_lot;
pub mod usage_audit_snapshot;
pub mod usage_detail;
pub mod usage_transaction;

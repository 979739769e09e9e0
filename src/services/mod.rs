// Stock usage ledger
pub mod usage;

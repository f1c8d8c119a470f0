//! Domain layer: ledger value types and the ports adapters implement.

pub mod limits;
pub mod money;
pub mod mutation;
pub mod ports;
pub mod provider;
pub mod records;
pub mod transaction;
pub mod wallet;

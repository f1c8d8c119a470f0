//! Adapters behind the domain ports: ledger stores, payment providers,
//! notification sinks and clocks.

pub mod clock;
pub mod in_memory;
pub mod notify;
pub mod providers;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

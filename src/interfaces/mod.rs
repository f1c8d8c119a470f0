//! Inbound adapters: the HTTP API and the settlement-report importer.

pub mod csv;
pub mod http;

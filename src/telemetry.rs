//! Tracing subscriber setup.
//!
//! Logs go to stderr; stdout is reserved for command output such as the
//! `import-report` CSV and the `sweep` report.

use crate::error::{LedgerError, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVE: &str = "wallet_ledger=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default directive.
pub fn init(json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|e| LedgerError::Config(format!("tracing subscriber: {e}")))
}

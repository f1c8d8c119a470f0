use crate::domain::money::{Amount, Currency};
use crate::domain::transaction::TransactionStatus;
use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Failures reported by a payment provider adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("operation not supported by provider: {0}")]
    Unsupported(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transient failures worth retrying without operator involvement.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::Unavailable(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else if let Some(status) = err.status()
            && status.is_client_error()
        {
            ProviderError::Rejected(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Insufficient funds in {currency} wallet of user {user_id}")]
    InsufficientFunds { user_id: String, currency: Currency },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Limit exceeded: limit {limit}, already used {used}")]
    LimitExceeded { limit: Decimal, used: Decimal },
    #[error("Duplicate reference: {0}")]
    DuplicateReference(String),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Webhook signature invalid")]
    SignatureInvalid,
    #[error("Invalid transition for {reference}: {from:?} -> {to:?}")]
    InvalidTransition {
        reference: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("Amount mismatch for {reference}: ledger holds {expected}, provider settled {settled}")]
    AmountMismatch {
        reference: String,
        expected: Amount,
        settled: Decimal,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn storage<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        LedgerError::Storage(err.into())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Storage(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for LedgerError {
    fn from(err: rocksdb::Error) -> Self {
        LedgerError::Storage(Box::new(err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        LedgerError::Config(err.to_string())
    }
}

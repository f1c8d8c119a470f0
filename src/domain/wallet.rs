use super::money::{Balance, Currency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authoritative balance of one user in one currency.
///
/// Exactly one wallet exists per `(user_id, currency)`. Only the ledger store
/// changes `balance`, and only as part of an applied mutation.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: String,
    pub currency: Currency,
    pub balance: Balance,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: impl Into<String>, currency: Currency, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            currency,
            balance: Balance::ZERO,
            updated_at: now,
        }
    }

    pub fn key(&self) -> WalletKey {
        WalletKey::new(&self.user_id, &self.currency)
    }
}

/// Lookup key of a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletKey {
    pub user_id: String,
    pub currency: Currency,
}

impl WalletKey {
    pub fn new(user_id: &str, currency: &Currency) -> Self {
        Self {
            user_id: user_id.to_string(),
            currency: currency.clone(),
        }
    }

    /// Stable byte encoding used as a storage key.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}\u{0}{}", self.user_id, self.currency).into_bytes()
    }
}

//! Provider-agnostic vocabulary shared by the gateway adapters, webhook ingestion
//! and the reconciliation sweeper.

use super::money::{Amount, Currency};
use crate::error::LedgerError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Paystack,
    Flutterwave,
    Simulated,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Paystack => "paystack",
            ProviderKind::Flutterwave => "flutterwave",
            ProviderKind::Simulated => "simulated",
        };
        f.write_str(name)
    }
}

impl FromStr for ProviderKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paystack" => Ok(ProviderKind::Paystack),
            "flutterwave" => Ok(ProviderKind::Flutterwave),
            "simulated" => Ok(ProviderKind::Simulated),
            other => Err(LedgerError::NotFound(format!("provider '{other}'"))),
        }
    }
}

/// The three-way status every adapter normalizes its vocabulary onto.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Successful,
    Failed,
    Pending,
}

/// Terminal outcome fed into settlement.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SettlementOutcome {
    Success,
    Failure,
}

impl ProviderStatus {
    pub fn settlement(&self) -> Option<SettlementOutcome> {
        match self {
            ProviderStatus::Successful => Some(SettlementOutcome::Success),
            ProviderStatus::Failed => Some(SettlementOutcome::Failure),
            ProviderStatus::Pending => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutcome {
    pub status: ProviderStatus,
    pub settled_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payer {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitializeRequest {
    pub reference: String,
    pub amount: Amount,
    pub currency: Currency,
    pub payer: Payer,
}

/// Handle returned by `initialize`: where to send the payer, or how to pay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Initialized {
    pub provider_reference: String,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    BankAccount {
        bank_code: String,
        account_number: String,
        account_name: Option<String>,
    },
    Biller {
        biller: String,
        customer: String,
    },
}

impl Destination {
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self {
            Destination::BankAccount {
                bank_code,
                account_number,
                ..
            } => {
                map.insert("bank_code".to_string(), bank_code.clone());
                map.insert("account_number".to_string(), account_number.clone());
            }
            Destination::Biller { biller, customer } => {
                map.insert("biller".to_string(), biller.clone());
                map.insert("account".to_string(), customer.clone());
            }
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub reference: String,
    pub destination: Destination,
    pub amount: Amount,
    pub currency: Currency,
    pub narration: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferReceipt {
    pub provider_reference: String,
    pub status: ProviderStatus,
}

/// A raw inbound callback. Header names are lower-cased.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Callback body normalized to `{event_id, reference, amount, status}`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub event_id: String,
    pub reference: String,
    pub amount: Option<Decimal>,
    pub status: ProviderStatus,
}

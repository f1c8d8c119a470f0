//! Payment provider adapters.
//!
//! Each adapter maps its provider's vocabulary onto [`ProviderStatus`] so webhook
//! ingestion and the sweeper never branch on provider names.
//!
//! [`ProviderStatus`]: crate::domain::provider::ProviderStatus

pub mod flutterwave;
pub mod paystack;
pub mod simulated;

use crate::config::ProvidersConfig;
use crate::domain::ports::SharedProvider;
use crate::domain::provider::ProviderKind;
use crate::error::{LedgerError, Result};
use hmac::Mac;
use hmac::digest::KeyInit;
use std::collections::HashMap;
use std::sync::Arc;

pub use flutterwave::FlutterwaveProvider;
pub use paystack::PaystackProvider;
pub use simulated::SimulatedProvider;

/// Adapters keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, SharedProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an adapter for every provider section present in `config`.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut registry = Self::new();
        if let Some(paystack) = &config.paystack {
            registry = registry.with(PaystackProvider::new(
                &paystack.base_url,
                &paystack.secret_key,
                config.timeout(),
            )?);
        }
        if let Some(flutterwave) = &config.flutterwave {
            registry = registry.with(FlutterwaveProvider::new(
                &flutterwave.base_url,
                &flutterwave.secret_key,
                &flutterwave.webhook_hash,
                config.timeout(),
            )?);
        }
        if let Some(simulated) = &config.simulated {
            registry = registry.with(SimulatedProvider::new(&simulated.webhook_secret));
        }
        Ok(registry)
    }

    pub fn register(mut self, provider: SharedProvider) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn with<P: crate::domain::ports::PaymentProvider + 'static>(self, provider: P) -> Self {
        self.register(Arc::new(provider))
    }

    pub fn get(&self, kind: ProviderKind) -> Result<SharedProvider> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("provider '{kind}' is not configured")))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Hex HMAC of `body` under `secret`.
pub(crate) fn sign_hex<M: Mac + KeyInit>(secret: &[u8], body: &[u8]) -> String {
    match <M as KeyInit>::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

/// Constant-time check of a hex HMAC signature.
pub(crate) fn verify_hex<M: Mac + KeyInit>(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = <M as KeyInit>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time equality for shared-secret headers.
pub(crate) fn secrets_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

use super::{sign_hex, verify_hex};
use crate::domain::ports::PaymentProvider;
use crate::domain::provider::{
    InitializeRequest, Initialized, ProviderKind, ProviderOutcome, ProviderStatus,
    TransferReceipt, TransferRequest, WebhookEvent, WebhookRequest,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use hmac::Hmac;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const SIGNATURE_HEADER: &str = "x-simulated-signature";

type Scripted<T> = Result<T, ProviderError>;

#[derive(Default)]
struct Script {
    verify: HashMap<String, VecDeque<Scripted<ProviderOutcome>>>,
    verify_calls: HashMap<String, usize>,
    initialize: VecDeque<Scripted<()>>,
    transfers: VecDeque<Scripted<ProviderStatus>>,
    transfer_requests: Vec<TransferRequest>,
}

/// An in-process provider whose answers are scripted ahead of time.
///
/// Its provider reference is the ledger reference itself. Unscripted `verify` calls
/// report `pending`; unscripted transfers are accepted as `pending`. Webhooks are
/// signed with HMAC-SHA256 in the `x-simulated-signature` header.
#[derive(Clone)]
pub struct SimulatedProvider {
    webhook_secret: String,
    script: Arc<Mutex<Script>>,
}

/// Wire format of a simulated callback, already in the normalized shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct SimulatedEvent {
    pub event_id: String,
    pub reference: String,
    pub amount: Option<Decimal>,
    pub status: ProviderStatus,
}

impl SimulatedProvider {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> Result<T, ProviderError> {
        self.script
            .lock()
            .map(|mut script| f(&mut script))
            .map_err(|_| ProviderError::Unavailable("simulated provider poisoned".to_string()))
    }

    /// Queue the next answer `verify` gives for `reference`. The last answer repeats.
    pub fn script_verify(&self, reference: &str, answer: Scripted<ProviderOutcome>) {
        let _ = self.with_script(|s| {
            s.verify
                .entry(reference.to_string())
                .or_default()
                .push_back(answer)
        });
    }

    pub fn script_initialize(&self, answer: Scripted<()>) {
        let _ = self.with_script(|s| s.initialize.push_back(answer));
    }

    pub fn script_transfer(&self, answer: Scripted<ProviderStatus>) {
        let _ = self.with_script(|s| s.transfers.push_back(answer));
    }

    pub fn verify_calls(&self, reference: &str) -> usize {
        self.with_script(|s| s.verify_calls.get(reference).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn transfer_requests(&self) -> Vec<TransferRequest> {
        self.with_script(|s| s.transfer_requests.clone())
            .unwrap_or_default()
    }

    /// Builds a signed callback for `event`.
    pub fn signed_webhook(&self, event: &SimulatedEvent) -> WebhookRequest {
        let body = serde_json::to_vec(event).unwrap_or_default();
        let signature = sign_hex::<Hmac<Sha256>>(self.webhook_secret.as_bytes(), &body);
        WebhookRequest::new(body).with_header(SIGNATURE_HEADER, signature)
    }
}

#[async_trait]
impl PaymentProvider for SimulatedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Simulated
    }

    async fn initialize(&self, request: &InitializeRequest) -> Result<Initialized, ProviderError> {
        self.with_script(|s| s.initialize.pop_front())?
            .unwrap_or(Ok(()))?;
        Ok(Initialized {
            provider_reference: request.reference.clone(),
            handle: format!("https://checkout.simulated.local/{}", request.reference),
        })
    }

    async fn verify(&self, provider_reference: &str) -> Result<ProviderOutcome, ProviderError> {
        self.with_script(|s| {
            *s.verify_calls
                .entry(provider_reference.to_string())
                .or_default() += 1;
            match s.verify.get_mut(provider_reference) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        })?
        .unwrap_or(Ok(ProviderOutcome {
            status: ProviderStatus::Pending,
            settled_amount: None,
        }))
    }

    async fn push_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ProviderError> {
        let answer = self.with_script(|s| {
            s.transfer_requests.push(request.clone());
            s.transfers.pop_front()
        })?;
        let status = answer.unwrap_or(Ok(ProviderStatus::Pending))?;
        Ok(TransferReceipt {
            provider_reference: request.reference.clone(),
            status,
        })
    }

    fn authenticate_webhook(&self, request: &WebhookRequest) -> bool {
        request
            .header(SIGNATURE_HEADER)
            .is_some_and(|signature| {
                verify_hex::<Hmac<Sha256>>(self.webhook_secret.as_bytes(), &request.body, signature)
            })
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<WebhookEvent, ProviderError> {
        let event: SimulatedEvent =
            serde_json::from_slice(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(WebhookEvent {
            event_id: event.event_id,
            reference: event.reference,
            amount: event.amount,
            status: event.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_verify_script_repeats_last_answer() {
        let provider = SimulatedProvider::new("secret");
        provider.script_verify("ref-1", Err(ProviderError::Timeout));
        provider.script_verify(
            "ref-1",
            Ok(ProviderOutcome {
                status: ProviderStatus::Successful,
                settled_amount: Some(dec!(500)),
            }),
        );

        assert_eq!(provider.verify("ref-1").await, Err(ProviderError::Timeout));
        for _ in 0..2 {
            let outcome = provider.verify("ref-1").await.unwrap();
            assert_eq!(outcome.status, ProviderStatus::Successful);
        }
        assert_eq!(provider.verify_calls("ref-1"), 3);
        assert_eq!(
            provider.verify("unknown").await.unwrap().status,
            ProviderStatus::Pending
        );
    }

    #[test]
    fn test_signed_webhook_authenticates() {
        let provider = SimulatedProvider::new("secret");
        let request = provider.signed_webhook(&SimulatedEvent {
            event_id: "evt-1".to_string(),
            reference: "ref-1".to_string(),
            amount: Some(dec!(500)),
            status: ProviderStatus::Successful,
        });
        assert!(provider.authenticate_webhook(&request));

        let forged = SimulatedProvider::new("wrong").signed_webhook(&SimulatedEvent {
            event_id: "evt-1".to_string(),
            reference: "ref-1".to_string(),
            amount: Some(dec!(500)),
            status: ProviderStatus::Successful,
        });
        assert!(!provider.authenticate_webhook(&forged));

        let event = provider.parse_webhook(&request.body).unwrap();
        assert_eq!(event.reference, "ref-1");
        assert_eq!(event.status, ProviderStatus::Successful);
    }
}

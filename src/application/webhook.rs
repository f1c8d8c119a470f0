use crate::application::ledger::MutationService;
use crate::domain::ports::{SharedClock, SharedLedgerStore};
use crate::domain::provider::{ProviderKind, WebhookRequest};
use crate::domain::records::{WebhookOutcome, WebhookRecord};
use crate::error::{LedgerError, Result};
use crate::infrastructure::providers::ProviderRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the provider is told about its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResponse {
    /// The outcome was applied, or did not need applying.
    Processed,
    /// The event id was seen before; nothing was reapplied.
    Duplicate,
    Unauthorized,
    BadRequest(String),
}

impl WebhookResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookResponse::Processed | WebhookResponse::Duplicate => 200,
            WebhookResponse::Unauthorized => 401,
            WebhookResponse::BadRequest(_) => 400,
        }
    }
}

/// Authenticates, deduplicates and applies inbound provider callbacks.
///
/// Safe to receive the same event any number of times: the event id is recorded
/// before settlement, and settlement itself is idempotent.
pub struct WebhookIngestion {
    store: SharedLedgerStore,
    ledger: Arc<MutationService>,
    providers: ProviderRegistry,
    clock: SharedClock,
}

impl WebhookIngestion {
    pub fn new(
        store: SharedLedgerStore,
        ledger: Arc<MutationService>,
        providers: ProviderRegistry,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            ledger,
            providers,
            clock,
        }
    }

    pub async fn handle(
        &self,
        provider: ProviderKind,
        request: WebhookRequest,
    ) -> Result<WebhookResponse> {
        let adapter = self.providers.get(provider)?;

        if !adapter.authenticate_webhook(&request) {
            warn!(%provider, "webhook signature rejected");
            self.record(provider, None, &request.body, WebhookOutcome::SignatureInvalid)
                .await?;
            return Ok(WebhookResponse::Unauthorized);
        }

        let event = match adapter.parse_webhook(&request.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(%provider, "malformed webhook: {e}");
                self.record(provider, None, &request.body, WebhookOutcome::Malformed)
                    .await?;
                return Ok(WebhookResponse::BadRequest(e.to_string()));
            }
        };

        if self
            .store
            .find_webhook(provider, &event.event_id)
            .await?
            .is_some()
        {
            debug!(%provider, event_id = %event.event_id, "duplicate webhook");
            return Ok(WebhookResponse::Duplicate);
        }
        let fresh = self
            .record(
                provider,
                Some(event.event_id.clone()),
                &request.body,
                WebhookOutcome::Accepted,
            )
            .await?;
        if !fresh {
            debug!(%provider, event_id = %event.event_id, "duplicate webhook (raced)");
            return Ok(WebhookResponse::Duplicate);
        }

        let Some(outcome) = event.status.settlement() else {
            debug!(%provider, reference = %event.reference, "non-terminal webhook");
            return Ok(WebhookResponse::Processed);
        };

        let actor = format!("webhook:{provider}");
        match self
            .ledger
            .settle(&event.reference, outcome, event.amount, &actor)
            .await
        {
            Ok(settlement) => {
                info!(
                    %provider,
                    event_id = %event.event_id,
                    reference = %event.reference,
                    status = ?settlement.transaction.status,
                    changed = settlement.changed,
                    "webhook applied"
                );
                Ok(WebhookResponse::Processed)
            }
            Err(LedgerError::NotFound(what)) => {
                warn!(%provider, reference = %event.reference, "webhook for unknown {what}");
                Ok(WebhookResponse::BadRequest(format!("unknown reference {}", event.reference)))
            }
            // already audited; a provider retry cannot change the answer
            Err(e @ (LedgerError::InvalidTransition { .. } | LedgerError::AmountMismatch { .. })) => {
                warn!(%provider, reference = %event.reference, "webhook not applied: {e}");
                Ok(WebhookResponse::Processed)
            }
            Err(e) => Err(e),
        }
    }

    async fn record(
        &self,
        provider: ProviderKind,
        event_id: Option<String>,
        body: &[u8],
        outcome: WebhookOutcome,
    ) -> Result<bool> {
        let record = WebhookRecord::new(provider, event_id, body, outcome, self.clock.now());
        self.store.insert_webhook(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::refund::RefundPolicy;
    use crate::domain::money::{Amount, Currency};
    use crate::domain::ports::LedgerStore;
    use crate::domain::provider::ProviderStatus;
    use crate::domain::transaction::{Direction, Transaction, TransactionStatus, TransactionType};
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use crate::infrastructure::notify::TracingNotifier;
    use crate::infrastructure::providers::sign_hex;
    use crate::infrastructure::providers::simulated::{
        SIGNATURE_HEADER, SimulatedEvent, SimulatedProvider,
    };
    use hmac::Hmac;
    use sha2::Sha256;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn setup() -> (WebhookIngestion, SimulatedProvider, Arc<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Arc::new(MutationService::new(
            store.clone(),
            clock.clone(),
            Arc::new(TracingNotifier),
            RefundPolicy::new(dec!(1000000)),
        ));
        let simulated = SimulatedProvider::new("whsec");
        let providers = ProviderRegistry::new().with(simulated.clone());
        let deposit = Transaction::new(
            "fund_1",
            "alice",
            TransactionType::Deposit,
            Direction::Credit,
            Amount::new(dec!(500)).unwrap(),
            Currency::ngn(),
            Utc::now(),
        );
        ledger.create_pending(deposit).await.unwrap();
        let ingestion = WebhookIngestion::new(store.clone(), ledger, providers, clock);
        (ingestion, simulated, store)
    }

    fn event(event_id: &str, reference: &str) -> SimulatedEvent {
        SimulatedEvent {
            event_id: event_id.to_string(),
            reference: reference.to_string(),
            amount: Some(dec!(500)),
            status: ProviderStatus::Successful,
        }
    }

    #[tokio::test]
    async fn test_forged_signature_is_recorded_not_applied() {
        let (ingestion, _, store) = setup().await;
        let forged = SimulatedProvider::new("guess").signed_webhook(&event("evt-1", "fund_1"));

        let response = ingestion.handle(ProviderKind::Simulated, forged).await.unwrap();
        assert_eq!(response, WebhookResponse::Unauthorized);
        assert_eq!(response.status_code(), 401);
        let tx = store.find_transaction("fund_1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_event_applies_once() {
        let (ingestion, simulated, store) = setup().await;
        let request = simulated.signed_webhook(&event("evt-1", "fund_1"));

        let first = ingestion
            .handle(ProviderKind::Simulated, request.clone())
            .await
            .unwrap();
        let second = ingestion.handle(ProviderKind::Simulated, request).await.unwrap();
        assert_eq!(first, WebhookResponse::Processed);
        assert_eq!(second, WebhookResponse::Duplicate);
        assert_eq!(second.status_code(), 200);

        let wallet = store.get_wallet("alice", &Currency::ngn()).await.unwrap().unwrap();
        assert_eq!(wallet.balance.0, dec!(500));
        assert!(store
            .find_webhook(ProviderKind::Simulated, "evt-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unknown_reference_is_bad_request() {
        let (ingestion, simulated, _) = setup().await;
        let request = simulated.signed_webhook(&event("evt-9", "nope"));
        let response = ingestion.handle(ProviderKind::Simulated, request).await.unwrap();
        assert!(matches!(response, WebhookResponse::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_garbage_body_is_bad_request() {
        let (ingestion, _, _) = setup().await;
        let body = b"not json".to_vec();
        let signature = sign_hex::<Hmac<Sha256>>(b"whsec", &body);
        let request = WebhookRequest::new(body).with_header(SIGNATURE_HEADER, signature);
        let response = ingestion.handle(ProviderKind::Simulated, request).await.unwrap();
        assert!(matches!(response, WebhookResponse::BadRequest(_)));
    }
}

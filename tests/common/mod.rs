#![allow(dead_code)]

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use wallet_ledger::application::ledger::{Correction, MutationService};
use wallet_ledger::application::limits::LimitEvaluator;
use wallet_ledger::application::payments::PaymentService;
use wallet_ledger::application::refund::RefundPolicy;
use wallet_ledger::application::sweeper::ReconciliationSweeper;
use wallet_ledger::application::webhook::WebhookIngestion;
use wallet_ledger::config::{LimitsConfig, RoutingConfig, SweeperConfig};
use wallet_ledger::domain::money::{Amount, Currency};
use wallet_ledger::domain::ports::LedgerStore;
use wallet_ledger::domain::provider::{ProviderOutcome, ProviderStatus, WebhookRequest};
use wallet_ledger::infrastructure::clock::ManualClock;
use wallet_ledger::infrastructure::in_memory::InMemoryLedgerStore;
use wallet_ledger::infrastructure::notify::{ChannelNotifier, Notice};
use wallet_ledger::infrastructure::providers::simulated::{SimulatedEvent, SimulatedProvider};
use wallet_ledger::infrastructure::providers::ProviderRegistry;

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// The whole service wired over an in-memory store, a manual clock and the
/// simulated provider.
pub struct Harness {
    pub store: Arc<InMemoryLedgerStore>,
    pub clock: ManualClock,
    pub simulated: SimulatedProvider,
    pub ledger: Arc<MutationService>,
    pub payments: Arc<PaymentService>,
    pub webhooks: Arc<WebhookIngestion>,
    pub sweeper: ReconciliationSweeper,
    pub notices: UnboundedReceiver<Notice>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_limits(LimitsConfig::default())
    }

    pub fn with_limits(limits: LimitsConfig) -> Self {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = ManualClock::new(Utc::now());
        let (notifier, notices) = ChannelNotifier::new();
        let notifier = Arc::new(notifier);
        let simulated = SimulatedProvider::new(WEBHOOK_SECRET);
        let providers = ProviderRegistry::new().with(simulated.clone());

        let ledger = Arc::new(MutationService::new(
            store.clone(),
            Arc::new(clock.clone()),
            notifier.clone(),
            RefundPolicy::new(Decimal::from(100_000)),
        ));
        let evaluator = Arc::new(LimitEvaluator::new(
            store.clone(),
            Arc::new(clock.clone()),
            limits,
        ));
        let payments = Arc::new(PaymentService::new(
            ledger.clone(),
            evaluator,
            providers.clone(),
            RoutingConfig::default(),
        ));
        let webhooks = Arc::new(WebhookIngestion::new(
            store.clone(),
            ledger.clone(),
            providers.clone(),
            Arc::new(clock.clone()),
        ));
        let sweeper = ReconciliationSweeper::new(
            store.clone(),
            ledger.clone(),
            providers,
            notifier,
            Arc::new(clock.clone()),
            SweeperConfig {
                max_attempts: 3,
                retry_initial_ms: 1,
                retry_max_elapsed_ms: 5,
                ..SweeperConfig::default()
            },
        );

        Self {
            store,
            clock,
            simulated,
            ledger,
            payments,
            webhooks,
            sweeper,
            notices,
        }
    }

    /// Opening balance through an audited adjustment.
    pub async fn credit(&self, user_id: &str, amount: Decimal) {
        self.ledger
            .manual_correct(
                "ops",
                Correction::AdjustBalance {
                    user_id: user_id.to_string(),
                    currency: Currency::ngn(),
                    delta: amount,
                    reason: "opening balance".to_string(),
                },
            )
            .await
            .unwrap();
    }

    pub async fn balance(&self, user_id: &str) -> Decimal {
        self.store
            .get_wallet(user_id, &Currency::ngn())
            .await
            .unwrap()
            .map(|wallet| wallet.balance.0)
            .unwrap_or_default()
    }

    pub async fn assert_consistent(&self, user_id: &str) {
        let audit = self
            .ledger
            .audit_wallet(user_id, &Currency::ngn())
            .await
            .unwrap();
        assert!(
            audit.is_consistent(),
            "{user_id}: balance {} but posted rows sum to {}",
            audit.balance,
            audit.expected
        );
    }

    pub fn webhook(
        &self,
        event_id: &str,
        reference: &str,
        amount: Decimal,
        status: ProviderStatus,
    ) -> WebhookRequest {
        self.simulated.signed_webhook(&SimulatedEvent {
            event_id: event_id.to_string(),
            reference: reference.to_string(),
            amount: Some(amount),
            status,
        })
    }

    pub fn provider_reports(&self, reference: &str, status: ProviderStatus, amount: Decimal) {
        self.simulated.script_verify(
            reference,
            Ok(ProviderOutcome {
                status,
                settled_amount: Some(amount),
            }),
        );
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::iter::from_fn(|| self.notices.try_recv().ok()).collect()
    }
}

pub fn ngn(amount: Decimal) -> Amount {
    Amount::new(amount).unwrap()
}

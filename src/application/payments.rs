use crate::application::ledger::MutationService;
use crate::application::limits::LimitEvaluator;
use crate::application::refund::RefundEngine;
use crate::config::RoutingConfig;
use crate::domain::limits::Usage;
use crate::domain::money::{Amount, Currency};
use crate::domain::ports::SharedProvider;
use crate::domain::provider::{
    Destination, InitializeRequest, Payer, SettlementOutcome, TransferRequest,
};
use crate::domain::transaction::{
    Direction, LimitKind, Transaction, TransactionStatus, TransactionType, generate_reference,
};
use crate::domain::wallet::Wallet;
use crate::error::{LedgerError, ProviderError, Result};
use crate::infrastructure::providers::ProviderRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// What every Mutation API call answers with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationReceipt {
    pub status: TransactionStatus,
    pub reference: String,
    /// Checkout link or payment instructions for funding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl From<&Transaction> for MutationReceipt {
    fn from(tx: &Transaction) -> Self {
        Self {
            status: tx.status,
            reference: tx.reference.clone(),
            handle: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub amount: Amount,
    #[serde(default = "Currency::ngn")]
    pub currency: Currency,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingMethod {
    Card,
    BankTransfer,
}

impl FundingMethod {
    fn transaction_type(&self) -> TransactionType {
        match self {
            FundingMethod::Card => TransactionType::CardFunding,
            FundingMethod::BankTransfer => TransactionType::Deposit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundRequest {
    pub user_id: String,
    pub amount: Amount,
    #[serde(default = "Currency::ngn")]
    pub currency: Currency,
    pub method: FundingMethod,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillRequest {
    pub user_id: String,
    pub amount: Amount,
    #[serde(default = "Currency::ngn")]
    pub currency: Currency,
    pub biller: String,
    pub account: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawRequest {
    pub user_id: String,
    pub amount: Amount,
    #[serde(default = "Currency::ngn")]
    pub currency: Currency,
    pub bank_code: String,
    pub account_number: String,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub reference: String,
    pub reason: String,
}

/// The Mutation API consumed by the UI and edge services.
///
/// Every call returns `{status, reference}`. Repeating a call with a reference that
/// was already used by the same user returns the recorded result instead of acting
/// twice.
pub struct PaymentService {
    ledger: Arc<MutationService>,
    limits: Arc<LimitEvaluator>,
    refunds: RefundEngine,
    providers: ProviderRegistry,
    routing: RoutingConfig,
}

impl PaymentService {
    pub fn new(
        ledger: Arc<MutationService>,
        limits: Arc<LimitEvaluator>,
        providers: ProviderRegistry,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            refunds: RefundEngine::new(ledger.clone()),
            ledger,
            limits,
            providers,
            routing,
        }
    }

    pub fn ledger(&self) -> &Arc<MutationService> {
        &self.ledger
    }

    pub async fn send(&self, request: SendRequest) -> Result<MutationReceipt> {
        let reference = client_reference(request.reference.as_deref(), "snd")?;
        if let Some(prior) = self.prior(&reference, &request.from).await? {
            return Ok(prior);
        }
        self.limits
            .ensure_allowed(&request.from, request.amount, LimitKind::Send, &request.currency)
            .await?;

        let tx = Transaction::new(
            reference.clone(),
            request.from.as_str(),
            TransactionType::Send,
            Direction::Debit,
            request.amount,
            request.currency,
            self.ledger.now(),
        )
        .with_description(request.description);
        match self.ledger.create_completed(tx, &request.to).await {
            Ok((sent, _)) => Ok(MutationReceipt::from(&sent)),
            Err(LedgerError::DuplicateReference(_)) => self.recorded(&reference).await,
            Err(e) => Err(e),
        }
    }

    /// Creates a pending funding row and asks the provider for a checkout handle.
    ///
    /// When the provider may have acted (timeout, 5xx, unreadable answer) the row stays
    /// pending for the sweeper; a rejection rolls it back. Both are reported to the caller.
    pub async fn fund(&self, request: FundRequest) -> Result<MutationReceipt> {
        let reference = client_reference(request.reference.as_deref(), "fnd")?;
        if let Some(prior) = self.prior(&reference, &request.user_id).await? {
            return Ok(prior);
        }
        let provider = self.providers.get(self.routing.funding)?;

        let tx = Transaction::new(
            reference.clone(),
            request.user_id.as_str(),
            request.method.transaction_type(),
            Direction::Credit,
            request.amount,
            request.currency.clone(),
            self.ledger.now(),
        )
        .with_provider(provider.kind())
        .with_description("wallet funding");
        if let Err(e) = self.ledger.create_pending(tx).await {
            return match e {
                LedgerError::DuplicateReference(_) => self.recorded(&reference).await,
                e => Err(e),
            };
        }

        let initialize = InitializeRequest {
            reference: reference.clone(),
            amount: request.amount,
            currency: request.currency,
            payer: Payer {
                user_id: request.user_id,
                email: request.email,
            },
        };
        match provider.initialize(&initialize).await {
            Ok(initialized) => {
                let tx = self
                    .ledger
                    .attach_provider_reference(&reference, &initialized.provider_reference)
                    .await?;
                info!(reference = %reference, provider = %provider.kind(), "funding initialized");
                Ok(MutationReceipt {
                    handle: Some(initialized.handle),
                    ..MutationReceipt::from(&tx)
                })
            }
            Err(e) if outcome_unknown(&e) => {
                warn!(reference = %reference, provider = %provider.kind(), "initialize outcome unknown ({e}), left pending");
                Err(e.into())
            }
            Err(e) => {
                warn!(reference = %reference, provider = %provider.kind(), "initialize failed: {e}");
                self.ledger.roll_back(&reference, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    /// Debits the wallet immediately, then asks the provider to pay the biller.
    pub async fn pay_bill(&self, request: BillRequest) -> Result<MutationReceipt> {
        let reference = client_reference(request.reference.as_deref(), "bil")?;
        if let Some(prior) = self.prior(&reference, &request.user_id).await? {
            return Ok(prior);
        }
        self.limits
            .ensure_allowed(&request.user_id, request.amount, LimitKind::Spend, &request.currency)
            .await?;
        let provider = self.providers.get(self.routing.bills)?;

        let destination = Destination::Biller {
            biller: request.biller.clone(),
            customer: request.account,
        };
        let mut tx = Transaction::new(
            reference.clone(),
            request.user_id.as_str(),
            TransactionType::BillPayment,
            Direction::Debit,
            request.amount,
            request.currency,
            self.ledger.now(),
        )
        .with_provider(provider.kind())
        .with_description(format!("{} bill payment", request.biller));
        tx.metadata = destination.metadata();

        let created = match self.ledger.create_optimistic(tx).await {
            Ok(created) => created,
            Err(LedgerError::DuplicateReference(_)) => return self.recorded(&reference).await,
            Err(e) => return Err(e),
        };
        let narration = created.description.clone();
        self.push(&provider, created, destination, narration).await
    }

    /// Holds the funds, then asks the provider to pay out to a bank account.
    pub async fn withdraw(&self, request: WithdrawRequest) -> Result<MutationReceipt> {
        let reference = client_reference(request.reference.as_deref(), "wdr")?;
        if let Some(prior) = self.prior(&reference, &request.user_id).await? {
            return Ok(prior);
        }
        self.limits
            .ensure_allowed(&request.user_id, request.amount, LimitKind::Send, &request.currency)
            .await?;
        let provider = self.providers.get(self.routing.transfers)?;

        let destination = Destination::BankAccount {
            bank_code: request.bank_code,
            account_number: request.account_number,
            account_name: request.account_name,
        };
        let narration = request
            .narration
            .unwrap_or_else(|| "wallet withdrawal".to_string());
        let mut tx = Transaction::new(
            reference.clone(),
            request.user_id.as_str(),
            TransactionType::BankTransfer,
            Direction::Debit,
            request.amount,
            request.currency,
            self.ledger.now(),
        )
        .with_provider(provider.kind())
        .with_description(narration.clone());
        tx.metadata = destination.metadata();

        let created = match self.ledger.reserve(tx).await {
            Ok(created) => created,
            Err(LedgerError::DuplicateReference(_)) => return self.recorded(&reference).await,
            Err(e) => return Err(e),
        };
        self.push(&provider, created, destination, narration).await
    }

    /// Sends an already-debited payout to the provider and applies a synchronous
    /// answer. An unknown outcome leaves the row for the sweeper; a rejection reverses it.
    async fn push(
        &self,
        provider: &SharedProvider,
        tx: Transaction,
        destination: Destination,
        narration: String,
    ) -> Result<MutationReceipt> {
        let request = TransferRequest {
            reference: tx.reference.clone(),
            destination,
            amount: tx.amount,
            currency: tx.currency.clone(),
            narration,
        };
        let actor = format!("push:{}", provider.kind());
        match provider.push_transfer(&request).await {
            Ok(receipt) => {
                self.ledger
                    .attach_provider_reference(&tx.reference, &receipt.provider_reference)
                    .await?;
                let current = match receipt.status.settlement() {
                    Some(outcome) => {
                        self.ledger
                            .settle(&tx.reference, outcome, None, &actor)
                            .await?
                            .transaction
                    }
                    None => self.ledger.transaction(&tx.reference).await?,
                };
                Ok(MutationReceipt::from(&current))
            }
            Err(e) if outcome_unknown(&e) => {
                warn!(reference = %tx.reference, "payout outcome unknown ({e}), left for reconciliation");
                Ok(MutationReceipt::from(&tx))
            }
            Err(e) => {
                warn!(reference = %tx.reference, "payout rejected: {e}");
                self.ledger
                    .settle(
                        &tx.reference,
                        SettlementOutcome::Failure,
                        None,
                        &actor,
                    )
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Refunds a completed transaction; answers with the compensating row.
    pub async fn refund(&self, request: RefundRequest, actor: &str) -> Result<MutationReceipt> {
        let reversal = self
            .refunds
            .refund(&request.reference, &request.reason, actor)
            .await?;
        Ok(MutationReceipt::from(&reversal.refund))
    }

    pub async fn get_usage(&self, user_id: &str) -> Result<Usage> {
        self.limits.usage(user_id).await
    }

    pub async fn wallet(&self, user_id: &str, currency: &Currency) -> Result<Wallet> {
        self.ledger
            .store()
            .get_wallet(user_id, currency)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("{currency} wallet of user {user_id}")))
    }

    async fn prior(&self, reference: &str, user_id: &str) -> Result<Option<MutationReceipt>> {
        match self.ledger.store().find_transaction(reference).await? {
            Some(tx) if tx.user_id != user_id => Err(LedgerError::Validation(format!(
                "reference {reference} is already in use"
            ))),
            Some(tx) => Ok(Some(MutationReceipt::from(&tx))),
            None => Ok(None),
        }
    }

    async fn recorded(&self, reference: &str) -> Result<MutationReceipt> {
        let tx = self.ledger.transaction(reference).await?;
        Ok(MutationReceipt::from(&tx))
    }
}

/// Separates caller references from the `<reference>:<suffix>` rows the ledger derives.
const DERIVED_SEPARATOR: char = ':';

/// The caller's reference, or a generated one. Caller references may not use the
/// separator of derived rows (`:refund`, `:receive`).
fn client_reference(supplied: Option<&str>, prefix: &str) -> Result<String> {
    let Some(reference) = supplied else {
        return Ok(generate_reference(prefix));
    };
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(LedgerError::Validation("reference must not be empty".to_string()));
    }
    if reference.contains(DERIVED_SEPARATOR) {
        return Err(LedgerError::Validation(format!(
            "reference {reference} must not contain '{DERIVED_SEPARATOR}'"
        )));
    }
    Ok(reference.to_string())
}

/// Errors after which the provider may already have acted on the request.
fn outcome_unknown(error: &ProviderError) -> bool {
    error.is_retryable() || matches!(error, ProviderError::Malformed(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::refund::RefundPolicy;
    use crate::config::{LimitsConfig, RoutingConfig};
    use crate::domain::provider::ProviderStatus;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use crate::infrastructure::notify::TracingNotifier;
    use crate::infrastructure::providers::SimulatedProvider;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn service() -> (PaymentService, SimulatedProvider) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Arc::new(MutationService::new(
            store.clone(),
            clock.clone(),
            Arc::new(TracingNotifier),
            RefundPolicy::new(dec!(100000)),
        ));
        let limits = Arc::new(LimitEvaluator::new(store, clock, LimitsConfig::default()));
        let simulated = SimulatedProvider::new("whsec");
        let service = PaymentService::new(
            ledger,
            limits,
            ProviderRegistry::new().with(simulated.clone()),
            RoutingConfig::default(),
        );
        (service, simulated)
    }

    #[tokio::test]
    async fn test_fund_returns_checkout_handle() {
        let (service, _) = service();
        let receipt = service
            .fund(FundRequest {
                user_id: "alice".to_string(),
                amount: Amount::new(dec!(500)).unwrap(),
                currency: Currency::ngn(),
                method: FundingMethod::Card,
                email: None,
                reference: Some("fund_1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(receipt.status, TransactionStatus::Pending);
        assert!(receipt.handle.unwrap().ends_with("fund_1"));
        let tx = service.ledger().transaction("fund_1").await.unwrap();
        assert_eq!(tx.r#type, TransactionType::CardFunding);
        assert_eq!(tx.provider_reference.as_deref(), Some("fund_1"));
    }

    #[tokio::test]
    async fn test_rejected_initialize_rolls_back() {
        let (service, simulated) = service();
        simulated.script_initialize(Err(ProviderError::Rejected("invalid email".to_string())));
        let err = service
            .fund(FundRequest {
                user_id: "alice".to_string(),
                amount: Amount::new(dec!(500)).unwrap(),
                currency: Currency::ngn(),
                method: FundingMethod::BankTransfer,
                email: None,
                reference: Some("fund_2".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Provider(ProviderError::Rejected(_))));
        let tx = service.ledger().transaction("fund_2").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_withdrawal_failure_is_refunded() {
        let (service, simulated) = service();
        service
            .ledger()
            .manual_correct(
                "ops",
                crate::application::ledger::Correction::AdjustBalance {
                    user_id: "alice".to_string(),
                    currency: Currency::ngn(),
                    delta: dec!(1000),
                    reason: "opening balance".to_string(),
                },
            )
            .await
            .unwrap();
        simulated.script_transfer(Ok(ProviderStatus::Failed));

        let receipt = service
            .withdraw(WithdrawRequest {
                user_id: "alice".to_string(),
                amount: Amount::new(dec!(400)).unwrap(),
                currency: Currency::ngn(),
                bank_code: "058".to_string(),
                account_number: "0123456789".to_string(),
                account_name: None,
                narration: None,
                reference: Some("wd_1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(receipt.status, TransactionStatus::Failed);
        let wallet = service.wallet("alice", &Currency::ngn()).await.unwrap();
        assert_eq!(wallet.balance.0, dec!(1000));
        let refund = service.ledger().transaction("wd_1:refund").await.unwrap();
        assert_eq!(refund.direction, Direction::Credit);
        assert_eq!(simulated.transfer_requests().len(), 1);
    }

    #[test]
    fn test_client_reference_rules() {
        assert_eq!(client_reference(Some(" inv-42 "), "snd").unwrap(), "inv-42");
        assert!(client_reference(None, "snd").unwrap().starts_with("snd_"));
        for bad in ["", "   ", "snd_1:refund", "snd_1:receive", "a:b"] {
            assert!(matches!(
                client_reference(Some(bad), "snd"),
                Err(LedgerError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_reference_reuse_by_other_user_is_rejected() {
        let (service, _) = service();
        service
            .fund(FundRequest {
                user_id: "alice".to_string(),
                amount: Amount::new(dec!(10)).unwrap(),
                currency: Currency::ngn(),
                method: FundingMethod::Card,
                email: None,
                reference: Some("shared".to_string()),
            })
            .await
            .unwrap();
        let err = service
            .fund(FundRequest {
                user_id: "mallory".to_string(),
                amount: Amount::new(dec!(10)).unwrap(),
                currency: Currency::ngn(),
                method: FundingMethod::Card,
                email: None,
                reference: Some("shared".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}

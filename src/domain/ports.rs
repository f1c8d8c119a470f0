use super::limits::LimitProfile;
use super::money::{Amount, Currency};
use super::mutation::{ApplyOutcome, Mutation};
use super::provider::{
    InitializeRequest, Initialized, ProviderKind, ProviderOutcome, TransferReceipt,
    TransferRequest, WebhookEvent, WebhookRequest,
};
use super::records::{AuditRecord, WebhookRecord};
use super::transaction::{Transaction, TransactionStatus, TransactionType};
use super::wallet::Wallet;
use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Durable table of wallets, transactions, webhook and audit records.
///
/// `apply` is the only way to change a balance or a transaction row; it commits the
/// whole mutation atomically or reports a conflict without writing anything.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_wallet(&self, user_id: &str, currency: &Currency) -> Result<Option<Wallet>>;
    async fn wallets_for_user(&self, user_id: &str) -> Result<Vec<Wallet>>;
    async fn find_transaction(&self, reference: &str) -> Result<Option<Transaction>>;
    async fn transactions_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>>;
    /// Provider-backed rows still awaiting an outcome, created at or before `older_than`.
    async fn stale_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>>;
    async fn apply(&self, mutation: Mutation) -> Result<ApplyOutcome>;
    /// Inserts the record unless one with the same provider event id exists.
    async fn insert_webhook(&self, record: WebhookRecord) -> Result<bool>;
    async fn find_webhook(
        &self,
        provider: ProviderKind,
        event_id: &str,
    ) -> Result<Option<WebhookRecord>>;
    async fn append_audit(&self, record: AuditRecord) -> Result<()>;
    async fn audit_for(&self, target_id: &str) -> Result<Vec<AuditRecord>>;
    async fn get_limit_profile(&self, user_id: &str) -> Result<Option<LimitProfile>>;
    async fn put_limit_profile(&self, profile: LimitProfile) -> Result<()>;
}

pub type SharedLedgerStore = Arc<dyn LedgerStore>;

/// One external payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    async fn initialize(
        &self,
        request: &InitializeRequest,
    ) -> std::result::Result<Initialized, ProviderError>;
    async fn verify(
        &self,
        provider_reference: &str,
    ) -> std::result::Result<ProviderOutcome, ProviderError>;
    async fn push_transfer(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferReceipt, ProviderError>;
    /// Checks the provider's authenticity header against the configured secret.
    fn authenticate_webhook(&self, request: &WebhookRequest) -> bool;
    fn parse_webhook(&self, body: &[u8]) -> std::result::Result<WebhookEvent, ProviderError>;
}

pub type SharedProvider = Arc<dyn PaymentProvider>;

/// Emitted on every terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub r#type: TransactionType,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub reference: String,
}

impl From<&Transaction> for Notification {
    fn from(tx: &Transaction) -> Self {
        Self {
            user_id: tx.user_id.clone(),
            r#type: tx.r#type,
            amount: tx.amount,
            status: tx.status,
            reference: tx.reference.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorAlert {
    pub reference: String,
    pub message: String,
}

/// Fire-and-forget delivery; failures are logged by callers, never propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
    async fn alert(&self, alert: OperatorAlert) -> Result<()>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

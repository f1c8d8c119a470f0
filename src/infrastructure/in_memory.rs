use crate::domain::limits::LimitProfile;
use crate::domain::money::Currency;
use crate::domain::mutation::{ApplyOutcome, Mutation};
use crate::domain::ports::LedgerStore;
use crate::domain::provider::ProviderKind;
use crate::domain::records::{AuditRecord, WebhookRecord};
use crate::domain::transaction::{Transaction, TransactionStatus};
use crate::domain::wallet::{Wallet, WalletKey};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    wallets: HashMap<WalletKey, Wallet>,
    transactions: HashMap<String, Transaction>,
    webhooks: Vec<WebhookRecord>,
    webhook_index: HashMap<String, usize>,
    audits: Vec<AuditRecord>,
    limits: HashMap<String, LimitProfile>,
}

/// A thread-safe in-memory ledger store.
///
/// All tables sit behind one `RwLock`, so a mutation is validated and committed
/// under a single write guard. Ideal for testing and local runs where persistence
/// is not required.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rows the sweeper should re-query: provider-backed, unresolved, not escalated.
pub(crate) fn needs_reconciliation(tx: &Transaction, older_than: DateTime<Utc>) -> bool {
    tx.provider.is_some()
        && !tx.escalated
        && tx.created_at <= older_than
        && (tx.status == TransactionStatus::Pending || tx.awaiting_confirmation())
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_wallet(&self, user_id: &str, currency: &Currency) -> Result<Option<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables.wallets.get(&WalletKey::new(user_id, currency)).cloned())
    }

    async fn wallets_for_user(&self, user_id: &str) -> Result<Vec<Wallet>> {
        let tables = self.tables.read().await;
        let mut wallets: Vec<Wallet> = tables
            .wallets
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        wallets.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(wallets)
    }

    async fn find_transaction(&self, reference: &str) -> Result<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.get(reference).cloned())
    }

    async fn transactions_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|tx| tx.user_id == user_id && tx.created_at >= since)
            .cloned()
            .collect();
        found.sort_by_key(|tx| tx.created_at);
        Ok(found)
    }

    async fn stale_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|tx| needs_reconciliation(tx, older_than))
            .cloned()
            .collect();
        found.sort_by_key(|tx| tx.created_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn apply(&self, mutation: Mutation) -> Result<ApplyOutcome> {
        let mut tables = self.tables.write().await;

        let balances = match mutation.validate(
            |reference| tables.transactions.get(reference).map(|tx| tx.version),
            |key| tables.wallets.get(key).map(|w| w.balance),
        ) {
            Ok(balances) => balances,
            Err(conflict) => return Ok(ApplyOutcome::Conflict(conflict)),
        };

        let now = Utc::now();
        for (key, balance) in balances {
            let wallet = tables
                .wallets
                .entry(key.clone())
                .or_insert_with(|| Wallet::new(&key.user_id, key.currency.clone(), now));
            wallet.balance = balance;
            wallet.updated_at = now;
        }
        for write in mutation.writes {
            let mut tx = write.transaction;
            tx.version = Mutation::next_version(write.precondition);
            tables.transactions.insert(tx.reference.clone(), tx);
        }
        if let Some(audit) = mutation.audit {
            tables.audits.push(audit);
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn insert_webhook(&self, record: WebhookRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if let Some(key) = record.dedup_key() {
            if tables.webhook_index.contains_key(&key) {
                return Ok(false);
            }
            let position = tables.webhooks.len();
            tables.webhook_index.insert(key, position);
        }
        tables.webhooks.push(record);
        Ok(true)
    }

    async fn find_webhook(
        &self,
        provider: ProviderKind,
        event_id: &str,
    ) -> Result<Option<WebhookRecord>> {
        let tables = self.tables.read().await;
        let key = format!("{provider}:{event_id}");
        Ok(tables
            .webhook_index
            .get(&key)
            .and_then(|&position| tables.webhooks.get(position))
            .cloned())
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.audits.push(record);
        Ok(())
    }

    async fn audit_for(&self, target_id: &str) -> Result<Vec<AuditRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .audits
            .iter()
            .filter(|a| a.target_id == target_id)
            .cloned()
            .collect())
    }

    async fn get_limit_profile(&self, user_id: &str) -> Result<Option<LimitProfile>> {
        let tables = self.tables.read().await;
        Ok(tables.limits.get(user_id).cloned())
    }

    async fn put_limit_profile(&self, profile: LimitProfile) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.limits.insert(profile.user_id.clone(), profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Balance};
    use crate::domain::mutation::Conflict;
    use crate::domain::records::{AuditAction, WebhookOutcome};
    use crate::domain::transaction::{Direction, TransactionType};
    use rust_decimal_macros::dec;

    fn deposit(reference: &str, amount: rust_decimal::Decimal) -> Transaction {
        Transaction::new(
            reference,
            "alice",
            TransactionType::Deposit,
            Direction::Credit,
            Amount::new(amount).unwrap(),
            Currency::ngn(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_apply_creates_wallet_and_bumps_version() {
        let store = InMemoryLedgerStore::new();
        let outcome = store
            .apply(Mutation::new().post(deposit("dep-1", dec!(100.0)), true))
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let wallet = store.get_wallet("alice", &Currency::ngn()).await.unwrap().unwrap();
        assert_eq!(wallet.balance, Balance::new(dec!(100.0)));

        let stored = store.find_transaction("dep-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.posted);

        assert!(store.get_wallet("bob", &Currency::ngn()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_is_all_or_nothing() {
        let store = InMemoryLedgerStore::new();
        store
            .apply(Mutation::new().post(deposit("dep-1", dec!(10.0)), true))
            .await
            .unwrap();

        // a fresh row plus an overdraft: neither may land
        let mutation = Mutation::new()
            .post(deposit("dep-2", dec!(5.0)), true)
            .adjust("alice", &Currency::ngn(), Balance::new(dec!(-100)));
        let outcome = store.apply(mutation).await.unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Conflict(Conflict::InsufficientFunds(_))
        ));
        assert!(store.find_transaction("dep-2").await.unwrap().is_none());
        let wallet = store.get_wallet("alice", &Currency::ngn()).await.unwrap().unwrap();
        assert_eq!(wallet.balance, Balance::new(dec!(10.0)));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = InMemoryLedgerStore::new();
        store
            .apply(Mutation::new().insert(deposit("dep-1", dec!(10.0))))
            .await
            .unwrap();
        let first = store.find_transaction("dep-1").await.unwrap().unwrap();

        let mut winner = first.clone();
        winner.status = TransactionStatus::Failed;
        assert!(store.apply(Mutation::new().update(winner)).await.unwrap().is_applied());

        let mut loser = first;
        loser.status = TransactionStatus::Completed;
        let outcome = store.apply(Mutation::new().update(loser)).await.unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Conflict(Conflict::StaleVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_webhook_dedup() {
        let store = InMemoryLedgerStore::new();
        let record = |event: &str| {
            WebhookRecord::new(
                ProviderKind::Simulated,
                Some(event.to_string()),
                b"{}",
                WebhookOutcome::Accepted,
                Utc::now(),
            )
        };
        assert!(store.insert_webhook(record("evt-1")).await.unwrap());
        assert!(!store.insert_webhook(record("evt-1")).await.unwrap());
        assert!(store.insert_webhook(record("evt-2")).await.unwrap());
        assert!(
            store
                .find_webhook(ProviderKind::Simulated, "evt-1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_audit_lookup_by_target() {
        let store = InMemoryLedgerStore::new();
        let audit = AuditRecord::new(AuditAction::Anomaly, "system", "transaction", "ref-9", Utc::now());
        store.append_audit(audit.clone()).await.unwrap();
        assert_eq!(store.audit_for("ref-9").await.unwrap(), vec![audit]);
        assert!(store.audit_for("ref-1").await.unwrap().is_empty());
    }
}

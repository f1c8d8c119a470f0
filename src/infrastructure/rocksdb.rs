use super::in_memory::needs_reconciliation;
use crate::domain::limits::LimitProfile;
use crate::domain::money::Currency;
use crate::domain::mutation::{ApplyOutcome, Mutation};
use crate::domain::ports::LedgerStore;
use crate::domain::provider::ProviderKind;
use crate::domain::records::{AuditRecord, WebhookRecord};
use crate::domain::transaction::Transaction;
use crate::domain::wallet::{Wallet, WalletKey};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for wallet balances.
pub const CF_WALLETS: &str = "wallets";
/// Column Family for transaction rows, keyed by reference.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for inbound webhook records.
pub const CF_WEBHOOKS: &str = "webhooks";
/// Column Family for audit records, keyed by target then time.
pub const CF_AUDITS: &str = "audits";
/// Column Family for limit profiles.
pub const CF_LIMITS: &str = "limits";

/// A persistent ledger store using RocksDB.
///
/// Each table lives in its own Column Family. Mutations are validated and committed
/// as a single `WriteBatch` while holding the writer lock, so concurrent appliers
/// cannot interleave between the precondition check and the write.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every ledger column family exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_WALLETS, CF_TRANSACTIONS, CF_WEBHOOKS, CF_AUDITS, CF_LIMITS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            LedgerError::storage(std::io::Error::other(format!(
                "{name} column family not found"
            )))
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_pinned_cf(handle, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let handle = self.cf(cf)?;
        self.db.put_cf(handle, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, prefix: Option<&[u8]>) -> Result<Vec<T>> {
        let handle = self.cf(cf)?;
        let mode = match prefix {
            Some(prefix) => IteratorMode::From(prefix, rocksdb::Direction::Forward),
            None => IteratorMode::Start,
        };
        let mut items = Vec::new();
        for item in self.db.iterator_cf(handle, mode) {
            let (key, value) = item?;
            if let Some(prefix) = prefix
                && !key.starts_with(prefix)
            {
                break;
            }
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }

    fn audit_key(record: &AuditRecord) -> Vec<u8> {
        let mut key = Self::audit_prefix(&record.target_id);
        key.extend_from_slice(&record.created_at.timestamp_micros().to_be_bytes());
        key.extend_from_slice(record.id.as_bytes());
        key
    }

    fn audit_prefix(target_id: &str) -> Vec<u8> {
        let mut key = target_id.as_bytes().to_vec();
        key.push(0);
        key
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn get_wallet(&self, user_id: &str, currency: &Currency) -> Result<Option<Wallet>> {
        self.get_json(CF_WALLETS, &WalletKey::new(user_id, currency).encode())
    }

    async fn wallets_for_user(&self, user_id: &str) -> Result<Vec<Wallet>> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0);
        self.scan(CF_WALLETS, Some(&prefix))
    }

    async fn find_transaction(&self, reference: &str) -> Result<Option<Transaction>> {
        self.get_json(CF_TRANSACTIONS, reference.as_bytes())
    }

    async fn transactions_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        // TODO: add a (user, created_at) secondary index once ledgers outgrow full scans
        let mut found: Vec<Transaction> = self
            .scan::<Transaction>(CF_TRANSACTIONS, None)?
            .into_iter()
            .filter(|tx| tx.user_id == user_id && tx.created_at >= since)
            .collect();
        found.sort_by_key(|tx| tx.created_at);
        Ok(found)
    }

    async fn stale_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let mut found: Vec<Transaction> = self
            .scan::<Transaction>(CF_TRANSACTIONS, None)?
            .into_iter()
            .filter(|tx| needs_reconciliation(tx, older_than))
            .collect();
        found.sort_by_key(|tx| tx.created_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn apply(&self, mutation: Mutation) -> Result<ApplyOutcome> {
        let _guard = self.writer.lock().await;

        let mut versions = HashMap::new();
        for write in &mutation.writes {
            let reference = &write.transaction.reference;
            if let Some(stored) = self.get_json::<Transaction>(CF_TRANSACTIONS, reference.as_bytes())? {
                versions.insert(reference.clone(), stored.version);
            }
        }
        let mut wallets = HashMap::new();
        for change in &mutation.balance_changes {
            if let Some(wallet) = self.get_json::<Wallet>(CF_WALLETS, &change.wallet.encode())? {
                wallets.insert(change.wallet.clone(), wallet);
            }
        }

        let balances = match mutation.validate(
            |reference| versions.get(reference).copied(),
            |key| wallets.get(key).map(|w| w.balance),
        ) {
            Ok(balances) => balances,
            Err(conflict) => return Ok(ApplyOutcome::Conflict(conflict)),
        };

        let now = Utc::now();
        let mut batch = WriteBatch::default();
        let cf_wallets = self.cf(CF_WALLETS)?;
        for (key, balance) in balances {
            let mut wallet = wallets
                .remove(&key)
                .unwrap_or_else(|| Wallet::new(&key.user_id, key.currency.clone(), now));
            wallet.balance = balance;
            wallet.updated_at = now;
            batch.put_cf(cf_wallets, key.encode(), serde_json::to_vec(&wallet)?);
        }
        let cf_transactions = self.cf(CF_TRANSACTIONS)?;
        for write in mutation.writes {
            let mut tx = write.transaction;
            tx.version = Mutation::next_version(write.precondition);
            batch.put_cf(cf_transactions, tx.reference.as_bytes(), serde_json::to_vec(&tx)?);
        }
        if let Some(audit) = mutation.audit {
            batch.put_cf(self.cf(CF_AUDITS)?, Self::audit_key(&audit), serde_json::to_vec(&audit)?);
        }
        self.db.write(batch)?;

        Ok(ApplyOutcome::Applied)
    }

    async fn insert_webhook(&self, record: WebhookRecord) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let key = record
            .dedup_key()
            .unwrap_or_else(|| format!("unkeyed:{}", record.id));
        if self.get_json::<WebhookRecord>(CF_WEBHOOKS, key.as_bytes())?.is_some() {
            return Ok(false);
        }
        self.put_json(CF_WEBHOOKS, key.as_bytes(), &record)?;
        Ok(true)
    }

    async fn find_webhook(
        &self,
        provider: ProviderKind,
        event_id: &str,
    ) -> Result<Option<WebhookRecord>> {
        self.get_json(CF_WEBHOOKS, format!("{provider}:{event_id}").as_bytes())
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<()> {
        self.put_json(CF_AUDITS, &Self::audit_key(&record), &record)
    }

    async fn audit_for(&self, target_id: &str) -> Result<Vec<AuditRecord>> {
        self.scan(CF_AUDITS, Some(&Self::audit_prefix(target_id)))
    }

    async fn get_limit_profile(&self, user_id: &str) -> Result<Option<LimitProfile>> {
        self.get_json(CF_LIMITS, user_id.as_bytes())
    }

    async fn put_limit_profile(&self, profile: LimitProfile) -> Result<()> {
        self.put_json(CF_LIMITS, profile.user_id.as_bytes(), &profile)
    }
}

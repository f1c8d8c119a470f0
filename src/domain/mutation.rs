//! The atomic unit of work every ledger change goes through.
//!
//! A [`Mutation`] bundles wallet balance deltas, conditional transaction writes and
//! an optional audit entry. A store applies all of it or none of it, after checking
//! every precondition and the balance floor against the state it is about to change.

use super::money::{Balance, Currency};
use super::records::AuditRecord;
use super::transaction::Transaction;
use super::wallet::WalletKey;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub wallet: WalletKey,
    pub delta: Balance,
}

/// The stored state a write expects to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No transaction with this reference may exist yet.
    Absent,
    /// The stored transaction must still be at this version.
    Version(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionWrite {
    pub transaction: Transaction,
    pub precondition: Precondition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub balance_changes: Vec<BalanceChange>,
    pub writes: Vec<TransactionWrite>,
    pub audit: Option<AuditRecord>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new transaction row.
    pub fn insert(mut self, transaction: Transaction) -> Self {
        self.writes.push(TransactionWrite {
            transaction,
            precondition: Precondition::Absent,
        });
        self
    }

    /// Replace a transaction previously read at `transaction.version`.
    pub fn update(mut self, transaction: Transaction) -> Self {
        let precondition = Precondition::Version(transaction.version);
        self.writes.push(TransactionWrite {
            transaction,
            precondition,
        });
        self
    }

    /// Post the balance effect of `transaction` and mark it posted.
    pub fn post(self, mut transaction: Transaction, insert: bool) -> Self {
        let change = BalanceChange {
            wallet: WalletKey::new(&transaction.user_id, &transaction.currency),
            delta: transaction.balance_effect(),
        };
        transaction.posted = true;
        let mut mutation = if insert {
            self.insert(transaction)
        } else {
            self.update(transaction)
        };
        mutation.balance_changes.push(change);
        mutation
    }

    pub fn adjust(mut self, user_id: &str, currency: &Currency, delta: Balance) -> Self {
        self.balance_changes.push(BalanceChange {
            wallet: WalletKey::new(user_id, currency),
            delta,
        });
        self
    }

    pub fn with_audit(mut self, audit: AuditRecord) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Checks every precondition and the balance floor against stored state.
    ///
    /// `stored_version` reports the version of a stored transaction, `stored_balance`
    /// the balance of an existing wallet. On success returns the balance each touched
    /// wallet ends up with; nothing is returned for a partially valid mutation.
    pub fn validate<T, W>(
        &self,
        mut stored_version: T,
        mut stored_balance: W,
    ) -> Result<Vec<(WalletKey, Balance)>, Conflict>
    where
        T: FnMut(&str) -> Option<u64>,
        W: FnMut(&WalletKey) -> Option<Balance>,
    {
        let mut seen = HashSet::new();
        for write in &self.writes {
            let reference = write.transaction.reference.as_str();
            if !seen.insert(reference) {
                return Err(Conflict::DuplicateReference(reference.to_string()));
            }
            match (write.precondition, stored_version(reference)) {
                (Precondition::Absent, None) => {}
                (Precondition::Absent, Some(_)) => {
                    return Err(Conflict::DuplicateReference(reference.to_string()));
                }
                (Precondition::Version(_), None) => {
                    return Err(Conflict::Missing(reference.to_string()));
                }
                (Precondition::Version(expected), Some(actual)) if expected != actual => {
                    return Err(Conflict::StaleVersion {
                        reference: reference.to_string(),
                        expected,
                        actual,
                    });
                }
                (Precondition::Version(_), Some(_)) => {}
            }
        }

        let mut touched: BTreeMap<WalletKey, (bool, Balance)> = BTreeMap::new();
        for change in &self.balance_changes {
            let entry = touched.entry(change.wallet.clone()).or_insert_with(|| {
                match stored_balance(&change.wallet) {
                    Some(balance) => (true, balance),
                    None => (false, Balance::ZERO),
                }
            });
            entry.1 += change.delta;
        }

        let mut result = Vec::with_capacity(touched.len());
        for (wallet, (exists, balance)) in touched {
            if !exists && balance.is_negative() {
                return Err(Conflict::WalletMissing(wallet));
            }
            if balance.is_negative() {
                return Err(Conflict::InsufficientFunds(wallet));
            }
            result.push((wallet, balance));
        }
        Ok(result)
    }

    /// Version a write leaves behind once committed.
    pub fn next_version(precondition: Precondition) -> u64 {
        match precondition {
            Precondition::Absent => 1,
            Precondition::Version(version) => version + 1,
        }
    }
}

/// Why a store refused to apply a mutation. Nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    DuplicateReference(String),
    StaleVersion {
        reference: String,
        expected: u64,
        actual: u64,
    },
    Missing(String),
    InsufficientFunds(WalletKey),
    WalletMissing(WalletKey),
}

#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Conflict(Conflict),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

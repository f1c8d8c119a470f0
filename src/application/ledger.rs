//! The Mutation Service: the only code that changes balances or transaction status.
//!
//! Every change is expressed as a [`Mutation`] and handed to the store in one `apply`
//! call. Writes against an existing row carry the version they were planned from, so
//! when a webhook, the sweeper and a user request race on one reference exactly one
//! of them commits; the others re-read and find the work already done.

use crate::application::refund::RefundPolicy;
use crate::domain::money::{Amount, Balance, Currency};
use crate::domain::mutation::{ApplyOutcome, Conflict, Mutation};
use crate::domain::ports::{Notification, SharedClock, SharedLedgerStore, SharedNotifier};
use crate::domain::provider::SettlementOutcome;
use crate::domain::records::{AuditAction, AuditRecord};
use crate::domain::transaction::{
    Direction, Transaction, TransactionStatus, TransactionType, generate_reference,
};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Re-reads allowed when a conditional write loses a race.
const MAX_APPLY_ATTEMPTS: usize = 8;

/// Status a reversed original ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReversalTarget {
    Refunded,
    Failed,
}

impl ReversalTarget {
    pub fn status(&self) -> TransactionStatus {
        match self {
            ReversalTarget::Refunded => TransactionStatus::Refunded,
            ReversalTarget::Failed => TransactionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub transaction: Transaction,
    /// Compensating row written when a debit-first flow failed.
    pub refund: Option<Transaction>,
    /// `false` when the outcome had already been applied.
    pub changed: bool,
    pub audit: Option<AuditRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reversal {
    pub original: Transaction,
    pub refund: Transaction,
    /// The recipient side of a reversed send, with its own compensating row.
    pub counterpart: Option<(Transaction, Transaction)>,
}

/// Admin corrections. Both go through `apply` and always leave an audit record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Correction {
    ForceSettle {
        reference: String,
        outcome: SettlementOutcome,
        reason: String,
    },
    AdjustBalance {
        user_id: String,
        currency: Currency,
        delta: Decimal,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionResult {
    pub transaction: Transaction,
    pub refund: Option<Transaction>,
    pub audit: AuditRecord,
}

/// Result of recomputing a wallet from its posted rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletAudit {
    pub user_id: String,
    pub currency: Currency,
    pub balance: Balance,
    pub expected: Balance,
}

impl WalletAudit {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.expected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileFailure {
    pub attempts: u32,
    /// Set only on the call that crossed the attempt budget.
    pub escalated: bool,
}

enum Plan {
    NoOp,
    Apply(Mutation),
    Reject(TransactionStatus),
}

pub struct MutationService {
    store: SharedLedgerStore,
    clock: SharedClock,
    notifier: SharedNotifier,
    refunds: RefundPolicy,
}

impl MutationService {
    pub fn new(
        store: SharedLedgerStore,
        clock: SharedClock,
        notifier: SharedNotifier,
        refunds: RefundPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            refunds,
        }
    }

    pub fn store(&self) -> &SharedLedgerStore {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn transaction(&self, reference: &str) -> Result<Transaction> {
        self.store
            .find_transaction(reference)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {reference}")))
    }

    /// Records a provider-settled transaction with no balance effect yet.
    pub async fn create_pending(&self, mut tx: Transaction) -> Result<Transaction> {
        tx.status = TransactionStatus::Pending;
        tx.posted = false;
        let created = self.insert(Mutation::new().insert(tx)).await?;
        info!(reference = %created.reference, user_id = %created.user_id, kind = ?created.r#type, "pending transaction created");
        Ok(created)
    }

    /// Holds the funds of a pending payout: the debit is posted now and is compensated
    /// if the provider later reports failure.
    pub async fn reserve(&self, mut tx: Transaction) -> Result<Transaction> {
        ensure_debit(&tx)?;
        tx.status = TransactionStatus::Pending;
        let created = self.insert(Mutation::new().post(tx, true)).await?;
        info!(reference = %created.reference, user_id = %created.user_id, amount = %created.amount, "funds reserved");
        Ok(created)
    }

    /// Debit-first flows: the row is `completed` immediately and awaits provider
    /// confirmation; a later failure reverses it.
    pub async fn create_optimistic(&self, mut tx: Transaction) -> Result<Transaction> {
        ensure_debit(&tx)?;
        if tx.provider.is_none() {
            return Err(LedgerError::Validation(format!(
                "{} needs a provider to confirm it",
                tx.reference
            )));
        }
        tx.status = TransactionStatus::Completed;
        tx.confirmed = false;
        let created = self.insert(Mutation::new().post(tx, true)).await?;
        info!(reference = %created.reference, user_id = %created.user_id, amount = %created.amount, "optimistic debit applied");
        self.announce(&[], std::slice::from_ref(&created)).await;
        Ok(created)
    }

    /// Wallet-to-wallet transfer: debits the sender and credits the recipient in one
    /// unit. The recipient row is `<reference>:receive`.
    pub async fn create_completed(
        &self,
        mut sender: Transaction,
        recipient_id: &str,
    ) -> Result<(Transaction, Transaction)> {
        ensure_debit(&sender)?;
        if sender.user_id == recipient_id {
            return Err(LedgerError::Validation(
                "sender and recipient must differ".to_string(),
            ));
        }
        let receive_reference = format!("{}:receive", sender.reference);
        let mut receive = Transaction::new(
            receive_reference.clone(),
            recipient_id,
            TransactionType::Receive,
            Direction::Credit,
            sender.amount,
            sender.currency.clone(),
            sender.created_at,
        )
        .with_counterparty(sender.user_id.clone())
        .with_description(sender.description.clone());
        receive.status = TransactionStatus::Completed;
        receive.related_reference = Some(sender.reference.clone());

        sender.status = TransactionStatus::Completed;
        sender.counterparty_id = Some(recipient_id.to_string());
        sender.related_reference = Some(receive_reference);

        let mutation = Mutation::new().post(sender, true).post(receive, true);
        let written = match self.commit(mutation).await? {
            Ok(written) => written,
            Err(conflict) => return Err(conflict_error(conflict)),
        };
        let [sent, received] = two(written)?;
        info!(
            reference = %sent.reference,
            from = %sent.user_id,
            to = %received.user_id,
            amount = %sent.amount,
            "transfer completed"
        );
        self.announce(&[], &[sent.clone(), received.clone()]).await;
        Ok((sent, received))
    }

    pub async fn attach_provider_reference(
        &self,
        reference: &str,
        provider_reference: &str,
    ) -> Result<Transaction> {
        for _ in 0..MAX_APPLY_ATTEMPTS {
            let tx = self.transaction(reference).await?;
            if tx.provider_reference.as_deref() == Some(provider_reference) {
                return Ok(tx);
            }
            let mut next = tx;
            next.provider_reference = Some(provider_reference.to_string());
            next.updated_at = self.now();
            match self.commit(Mutation::new().update(next)).await? {
                Ok(mut written) => return single(&mut written),
                Err(conflict) if is_race(&conflict) => continue,
                Err(conflict) => return Err(conflict_error(conflict)),
            }
        }
        Err(gave_up(reference))
    }

    /// Abandons a pending row whose provider never accepted it.
    pub async fn roll_back(&self, reference: &str, reason: &str) -> Result<Transaction> {
        for _ in 0..MAX_APPLY_ATTEMPTS {
            let tx = self.transaction(reference).await?;
            match tx.status {
                TransactionStatus::RolledBack => return Ok(tx),
                TransactionStatus::Pending if !tx.posted => {}
                _ => {
                    return Err(self
                        .anomaly(&tx, TransactionStatus::RolledBack, "system", reason)
                        .await?);
                }
            }
            let mut next = tx.clone();
            next.status = TransactionStatus::RolledBack;
            next.updated_at = self.now();
            next.metadata
                .insert("rollback_reason".to_string(), reason.to_string());
            match self.commit(Mutation::new().update(next)).await? {
                Ok(mut written) => {
                    warn!(reference, reason, "transaction rolled back");
                    self.announce(&[&tx], &written).await;
                    return single(&mut written);
                }
                Err(conflict) if is_race(&conflict) => continue,
                Err(conflict) => return Err(conflict_error(conflict)),
            }
        }
        Err(gave_up(reference))
    }

    /// Applies a provider outcome. Webhooks, the sweeper, synchronous provider
    /// answers and settlement reports all come through here.
    ///
    /// Re-applying an outcome that already took effect is a no-op. An outcome that
    /// contradicts the recorded state is rejected with `InvalidTransition` and audited.
    pub async fn settle(
        &self,
        reference: &str,
        outcome: SettlementOutcome,
        settled_amount: Option<Decimal>,
        actor: &str,
    ) -> Result<Settlement> {
        self.settle_with(reference, outcome, settled_amount, actor, None)
            .await
    }

    async fn settle_with(
        &self,
        reference: &str,
        outcome: SettlementOutcome,
        settled_amount: Option<Decimal>,
        actor: &str,
        manual: Option<AuditRecord>,
    ) -> Result<Settlement> {
        for _ in 0..MAX_APPLY_ATTEMPTS {
            let tx = self.transaction(reference).await?;
            let now = self.now();
            let mutation = match self.plan_settlement(&tx, outcome, now) {
                Plan::NoOp => {
                    debug!(reference, ?outcome, status = ?tx.status, "outcome already applied");
                    let audit = match &manual {
                        Some(template) => {
                            let audit = template
                                .clone()
                                .with_snapshots(json!(tx), json!(tx));
                            self.store.append_audit(audit.clone()).await?;
                            Some(audit)
                        }
                        None => None,
                    };
                    return Ok(Settlement {
                        transaction: tx,
                        refund: None,
                        changed: false,
                        audit,
                    });
                }
                Plan::Reject(to) => {
                    return Err(self
                        .anomaly(&tx, to, actor, "provider outcome contradicts recorded state")
                        .await?);
                }
                Plan::Apply(mutation) => mutation,
            };

            if outcome == SettlementOutcome::Success
                && let Some(settled) = settled_amount
                && settled != tx.amount.value()
            {
                return Err(self.amount_mismatch(&tx, settled, actor).await?);
            }

            let (mutation, audit) = match &manual {
                Some(template) => {
                    let after = mutation
                        .writes
                        .first()
                        .map(|write| json!(write.transaction))
                        .unwrap_or_default();
                    let audit = template.clone().with_snapshots(json!(tx), after);
                    (mutation.with_audit(audit.clone()), Some(audit))
                }
                None => (mutation, None),
            };

            match self.commit(mutation).await? {
                Ok(written) => {
                    info!(reference, ?outcome, from = ?tx.status, actor, "transaction settled");
                    self.announce(&[&tx], &written).await;
                    let mut written = written.into_iter();
                    let transaction = written
                        .next()
                        .ok_or_else(|| LedgerError::storage("settlement wrote no rows"))?;
                    return Ok(Settlement {
                        transaction,
                        refund: written.next(),
                        changed: true,
                        audit,
                    });
                }
                Err(conflict) if is_race(&conflict) => {
                    debug!(reference, ?conflict, "lost a settlement race, re-reading");
                    continue;
                }
                Err(conflict) => return Err(conflict_error(conflict)),
            }
        }
        Err(gave_up(reference))
    }

    fn plan_settlement(
        &self,
        tx: &Transaction,
        outcome: SettlementOutcome,
        now: DateTime<Utc>,
    ) -> Plan {
        use SettlementOutcome::{Failure, Success};
        use TransactionStatus::*;

        let mut next = tx.clone();
        next.updated_at = now;
        match (tx.status, outcome) {
            (Pending, Success) => {
                next.status = Completed;
                next.confirmed = true;
                if tx.posted {
                    Plan::Apply(Mutation::new().update(next))
                } else {
                    Plan::Apply(Mutation::new().post(next, false))
                }
            }
            (Pending, Failure) => {
                next.status = Failed;
                if tx.posted {
                    Plan::Apply(compensation(next, tx, "provider reported failure", now))
                } else {
                    Plan::Apply(Mutation::new().update(next))
                }
            }
            (Completed, Success) if tx.awaiting_confirmation() => {
                next.confirmed = true;
                Plan::Apply(Mutation::new().update(next))
            }
            (Completed, Failure) if tx.awaiting_confirmation() => {
                next.status = Failed;
                Plan::Apply(compensation(next, tx, "provider reported failure", now))
            }
            (Completed | Refunded | Reversed, Success) => Plan::NoOp,
            (Failed | Refunded | Reversed, Failure) => Plan::NoOp,
            (_, Success) => Plan::Reject(Completed),
            (_, Failure) => Plan::Reject(Failed),
        }
    }

    /// Reverses a completed transaction with a linked `refund` row carrying the
    /// opposite balance effect. The original keeps its amount and reference.
    ///
    /// Reversing a send also reverses the recipient's `receive` row, so a refund never
    /// creates money. Repeating a reversal returns the rows written the first time.
    pub async fn reverse(
        &self,
        reference: &str,
        reason: &str,
        target: ReversalTarget,
        actor: &str,
    ) -> Result<Reversal> {
        for _ in 0..MAX_APPLY_ATTEMPTS {
            let original = self.transaction(reference).await?;
            if original.status != TransactionStatus::Completed {
                if original.status == target.status()
                    && let Some(refund) = self
                        .store
                        .find_transaction(&original.refund_reference())
                        .await?
                {
                    debug!(reference, "reversal already applied");
                    let counterpart = self.counterpart_of(&original).await?;
                    return Ok(Reversal {
                        original,
                        refund,
                        counterpart,
                    });
                }
                return Err(self
                    .anomaly(&original, target.status(), actor, reason)
                    .await?);
            }

            let now = self.now();
            let mut next = original.clone();
            next.status = target.status();
            next.updated_at = now;
            let mut mutation = compensation(next.clone(), &original, reason, now);
            let mut prior = vec![original.clone()];

            if original.r#type == TransactionType::Send
                && let Some(receive_reference) = &original.related_reference
                && let Some(receive) = self.store.find_transaction(receive_reference).await?
                && receive.status == TransactionStatus::Completed
            {
                let mut reversed = receive.clone();
                reversed.status = TransactionStatus::Reversed;
                reversed.updated_at = now;
                let recipient = compensation(reversed, &receive, reason, now);
                mutation.writes.extend(recipient.writes);
                mutation.balance_changes.extend(recipient.balance_changes);
                prior.push(receive);
            }

            let audit = AuditRecord::new(AuditAction::Reversal, actor, "transaction", reference, now)
                .with_snapshots(json!(original), json!(next))
                .with_reason(reason);
            match self.commit(mutation.with_audit(audit)).await? {
                Ok(written) => {
                    info!(reference, actor, reason, status = ?target.status(), "transaction reversed");
                    let prior: Vec<&Transaction> = prior.iter().collect();
                    self.announce(&prior, &written).await;
                    let mut written = written.into_iter();
                    let (Some(original), Some(refund)) = (written.next(), written.next()) else {
                        return Err(LedgerError::storage("reversal wrote too few rows"));
                    };
                    let counterpart = written.next().zip(written.next());
                    return Ok(Reversal {
                        original,
                        refund,
                        counterpart,
                    });
                }
                Err(conflict) if is_race(&conflict) => continue,
                Err(conflict) => return Err(conflict_error(conflict)),
            }
        }
        Err(gave_up(reference))
    }

    async fn counterpart_of(
        &self,
        original: &Transaction,
    ) -> Result<Option<(Transaction, Transaction)>> {
        if original.r#type != TransactionType::Send {
            return Ok(None);
        }
        let Some(receive_reference) = &original.related_reference else {
            return Ok(None);
        };
        let Some(receive) = self.store.find_transaction(receive_reference).await? else {
            return Ok(None);
        };
        let refund = self
            .store
            .find_transaction(&receive.refund_reference())
            .await?;
        Ok(refund.map(|refund| (receive, refund)))
    }

    pub async fn manual_correct(&self, actor: &str, correction: Correction) -> Result<CorrectionResult> {
        if actor.trim().is_empty() {
            return Err(LedgerError::Validation("corrections need an actor".to_string()));
        }
        match correction {
            Correction::ForceSettle {
                reference,
                outcome,
                reason,
            } => {
                let template = AuditRecord::new(
                    AuditAction::ManualSettlement,
                    actor,
                    "transaction",
                    reference.as_str(),
                    self.now(),
                )
                .with_reason(reason);
                let settlement = self
                    .settle_with(&reference, outcome, None, actor, Some(template))
                    .await?;
                let audit = settlement
                    .audit
                    .ok_or_else(|| LedgerError::storage("manual settlement left no audit"))?;
                warn!(reference, actor, ?outcome, "manual settlement");
                Ok(CorrectionResult {
                    transaction: settlement.transaction,
                    refund: settlement.refund,
                    audit,
                })
            }
            Correction::AdjustBalance {
                user_id,
                currency,
                delta,
                reason,
            } => self.adjust_balance(actor, &user_id, currency, delta, &reason).await,
        }
    }

    async fn adjust_balance(
        &self,
        actor: &str,
        user_id: &str,
        currency: Currency,
        delta: Decimal,
        reason: &str,
    ) -> Result<CorrectionResult> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation("adjustments need a reason".to_string()));
        }
        let amount = Amount::new(delta.abs())?;
        let direction = if delta.is_sign_negative() {
            Direction::Debit
        } else {
            Direction::Credit
        };
        let now = self.now();
        let before = self
            .store
            .get_wallet(user_id, &currency)
            .await?
            .map(|wallet| wallet.balance)
            .unwrap_or(Balance::ZERO);

        let mut tx = Transaction::new(
            generate_reference("adj"),
            user_id,
            TransactionType::Adjustment,
            direction,
            amount,
            currency.clone(),
            now,
        )
        .with_description(reason);
        tx.status = TransactionStatus::Completed;

        let audit = AuditRecord::new(
            AuditAction::ManualAdjustment,
            actor,
            "wallet",
            format!("{user_id}:{currency}"),
            now,
        )
        .with_snapshots(
            json!({ "balance": before }),
            json!({ "balance": before + direction.signed(amount), "reference": tx.reference }),
        )
        .with_reason(reason);

        let transaction = self
            .insert(Mutation::new().post(tx, true).with_audit(audit.clone()))
            .await?;
        warn!(user_id, actor, %delta, %currency, reason, "manual balance adjustment");
        Ok(CorrectionResult {
            transaction,
            refund: None,
            audit,
        })
    }

    /// Counts one failed reconciliation attempt; at `max_attempts` the row is marked
    /// escalated and no longer polled.
    pub async fn record_reconcile_failure(
        &self,
        reference: &str,
        max_attempts: u32,
        reason: &str,
    ) -> Result<ReconcileFailure> {
        for _ in 0..MAX_APPLY_ATTEMPTS {
            let tx = self.transaction(reference).await?;
            if tx.escalated {
                return Ok(ReconcileFailure {
                    attempts: tx.reconcile_attempts,
                    escalated: false,
                });
            }
            let now = self.now();
            let mut next = tx.clone();
            next.reconcile_attempts += 1;
            next.updated_at = now;
            let escalated = next.reconcile_attempts >= max_attempts;
            next.escalated = escalated;
            let attempts = next.reconcile_attempts;

            let mut mutation = Mutation::new().update(next.clone());
            if escalated {
                mutation = mutation.with_audit(
                    AuditRecord::new(AuditAction::Escalation, "sweeper", "transaction", reference, now)
                        .with_snapshots(json!(tx), json!(next))
                        .with_reason(reason),
                );
            }
            match self.commit(mutation).await? {
                Ok(_) => return Ok(ReconcileFailure { attempts, escalated }),
                Err(conflict) if is_race(&conflict) => continue,
                Err(conflict) => return Err(conflict_error(conflict)),
            }
        }
        Err(gave_up(reference))
    }

    /// Recomputes a wallet from its posted rows.
    pub async fn audit_wallet(&self, user_id: &str, currency: &Currency) -> Result<WalletAudit> {
        let balance = self
            .store
            .get_wallet(user_id, currency)
            .await?
            .map(|wallet| wallet.balance)
            .unwrap_or(Balance::ZERO);
        let expected = self
            .store
            .transactions_for_user(user_id, DateTime::<Utc>::MIN_UTC)
            .await?
            .iter()
            .filter(|tx| tx.posted && &tx.currency == currency)
            .fold(Balance::ZERO, |sum, tx| sum + tx.balance_effect());
        if balance != expected {
            warn!(user_id, %currency, %balance, %expected, "wallet does not match its ledger");
        }
        Ok(WalletAudit {
            user_id: user_id.to_string(),
            currency: currency.clone(),
            balance,
            expected,
        })
    }

    async fn insert(&self, mutation: Mutation) -> Result<Transaction> {
        match self.commit(mutation).await? {
            Ok(mut written) => single(&mut written),
            Err(conflict) => Err(conflict_error(conflict)),
        }
    }

    /// Applies `mutation`, returning the rows as stored.
    async fn commit(&self, mutation: Mutation) -> Result<std::result::Result<Vec<Transaction>, Conflict>> {
        let written: Vec<Transaction> = mutation
            .writes
            .iter()
            .map(|write| {
                let mut tx = write.transaction.clone();
                tx.version = Mutation::next_version(write.precondition);
                tx
            })
            .collect();
        match self.store.apply(mutation).await? {
            ApplyOutcome::Applied => Ok(Ok(written)),
            ApplyOutcome::Conflict(conflict) => Ok(Err(conflict)),
        }
    }

    async fn anomaly(
        &self,
        tx: &Transaction,
        to: TransactionStatus,
        actor: &str,
        reason: &str,
    ) -> Result<LedgerError> {
        warn!(reference = %tx.reference, from = ?tx.status, to = ?to, actor, reason, "invalid transition");
        let audit = AuditRecord::new(AuditAction::Anomaly, actor, "transaction", tx.reference.as_str(), self.now())
            .with_snapshots(json!(tx), json!({ "requested_status": to }))
            .with_reason(format!("invalid transition: {reason}"));
        self.store.append_audit(audit).await?;
        Ok(LedgerError::InvalidTransition {
            reference: tx.reference.clone(),
            from: tx.status,
            to,
        })
    }

    async fn amount_mismatch(
        &self,
        tx: &Transaction,
        settled: Decimal,
        actor: &str,
    ) -> Result<LedgerError> {
        warn!(reference = %tx.reference, expected = %tx.amount, %settled, actor, "provider settled a different amount");
        let audit = AuditRecord::new(AuditAction::Anomaly, actor, "transaction", tx.reference.as_str(), self.now())
            .with_snapshots(json!(tx), json!({ "settled_amount": settled }))
            .with_reason("amount mismatch");
        self.store.append_audit(audit).await?;
        Ok(LedgerError::AmountMismatch {
            reference: tx.reference.clone(),
            expected: tx.amount,
            settled,
        })
    }

    /// Notifies on terminal transitions. Delivery failures never undo the commit.
    async fn announce(&self, prior: &[&Transaction], written: &[Transaction]) {
        let before: HashMap<&str, TransactionStatus> = prior
            .iter()
            .map(|tx| (tx.reference.as_str(), tx.status))
            .collect();
        for tx in written {
            if before.get(tx.reference.as_str()) == Some(&tx.status) || !tx.status.is_terminal() {
                continue;
            }
            if tx.r#type == TransactionType::Refund {
                self.refunds.observe(self.notifier.as_ref(), tx).await;
                continue;
            }
            if let Err(e) = self.notifier.notify(Notification::from(tx)).await {
                warn!(reference = %tx.reference, "notification failed: {e}");
            }
        }
    }
}

/// Marks `next` (already moved to its new status) and posts a linked refund of
/// `original`'s balance effect.
fn compensation(
    next: Transaction,
    original: &Transaction,
    reason: &str,
    now: DateTime<Utc>,
) -> Mutation {
    let mut refund = Transaction::new(
        original.refund_reference(),
        original.user_id.clone(),
        TransactionType::Refund,
        original.direction.opposite(),
        original.amount,
        original.currency.clone(),
        now,
    )
    .with_description(reason);
    refund.status = TransactionStatus::Completed;
    refund.counterparty_id = original.counterparty_id.clone();
    refund.related_reference = Some(original.reference.clone());
    Mutation::new().update(next).post(refund, true)
}

fn ensure_debit(tx: &Transaction) -> Result<()> {
    if tx.direction != Direction::Debit {
        return Err(LedgerError::Validation(format!(
            "{} must be a debit",
            tx.reference
        )));
    }
    Ok(())
}

/// Conflicts that mean another writer got there first.
fn is_race(conflict: &Conflict) -> bool {
    matches!(
        conflict,
        Conflict::StaleVersion { .. } | Conflict::DuplicateReference(_) | Conflict::Missing(_)
    )
}

fn conflict_error(conflict: Conflict) -> LedgerError {
    match conflict {
        Conflict::DuplicateReference(reference) => LedgerError::DuplicateReference(reference),
        Conflict::InsufficientFunds(wallet) | Conflict::WalletMissing(wallet) => {
            LedgerError::InsufficientFunds {
                user_id: wallet.user_id,
                currency: wallet.currency,
            }
        }
        Conflict::Missing(reference) => LedgerError::NotFound(format!("transaction {reference}")),
        Conflict::StaleVersion { reference, .. } => {
            LedgerError::storage(format!("concurrent update of {reference}"))
        }
    }
}

fn gave_up(reference: &str) -> LedgerError {
    LedgerError::storage(format!(
        "{reference}: still conflicting after {MAX_APPLY_ATTEMPTS} attempts"
    ))
}

fn single(written: &mut Vec<Transaction>) -> Result<Transaction> {
    written
        .drain(..)
        .next()
        .ok_or_else(|| LedgerError::storage("mutation wrote no rows"))
}

fn two(written: Vec<Transaction>) -> Result<[Transaction; 2]> {
    written
        .try_into()
        .map_err(|_| LedgerError::storage("expected two rows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::LedgerStore;
    use crate::domain::provider::ProviderKind;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use crate::infrastructure::notify::{ChannelNotifier, Notice};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        ledger: MutationService,
        store: Arc<InMemoryLedgerStore>,
        notices: UnboundedReceiver<Notice>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryLedgerStore::new());
        let (notifier, notices) = ChannelNotifier::new();
        let ledger = MutationService::new(
            store.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(notifier),
            RefundPolicy::new(dec!(100000)),
        );
        Harness {
            ledger,
            store,
            notices,
        }
    }

    fn amount(value: Decimal) -> Amount {
        Amount::new(value).unwrap()
    }

    fn tx(reference: &str, user: &str, r#type: TransactionType, direction: Direction, value: Decimal) -> Transaction {
        Transaction::new(reference, user, r#type, direction, amount(value), Currency::ngn(), Utc::now())
    }

    async fn fund(h: &Harness, user: &str, value: Decimal) {
        let deposit = tx(&generate_reference("seed"), user, TransactionType::Deposit, Direction::Credit, value)
            .with_provider(ProviderKind::Simulated);
        let created = h.ledger.create_pending(deposit).await.unwrap();
        h.ledger
            .settle(&created.reference, SettlementOutcome::Success, None, "test")
            .await
            .unwrap();
    }

    async fn balance(h: &Harness, user: &str) -> Balance {
        h.store
            .get_wallet(user, &Currency::ngn())
            .await
            .unwrap()
            .map(|w| w.balance)
            .unwrap_or(Balance::ZERO)
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let h = harness();
        let deposit = tx("fund_1", "alice", TransactionType::Deposit, Direction::Credit, dec!(500))
            .with_provider(ProviderKind::Simulated);
        h.ledger.create_pending(deposit).await.unwrap();

        for _ in 0..3 {
            let settlement = h
                .ledger
                .settle("fund_1", SettlementOutcome::Success, Some(dec!(500)), "test")
                .await
                .unwrap();
            assert_eq!(settlement.transaction.status, TransactionStatus::Completed);
        }
        assert_eq!(balance(&h, "alice").await, Balance::new(dec!(500)));
        assert!(h.ledger.audit_wallet("alice", &Currency::ngn()).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_conflicting_outcome_is_audited() {
        let h = harness();
        let deposit = tx("fund_2", "alice", TransactionType::Deposit, Direction::Credit, dec!(500))
            .with_provider(ProviderKind::Simulated);
        h.ledger.create_pending(deposit).await.unwrap();
        h.ledger
            .settle("fund_2", SettlementOutcome::Failure, None, "test")
            .await
            .unwrap();

        let err = h
            .ledger
            .settle("fund_2", SettlementOutcome::Success, None, "test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: TransactionStatus::Failed,
                to: TransactionStatus::Completed,
                ..
            }
        ));
        let audits = h.store.audit_for("fund_2").await.unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, AuditAction::Anomaly);
        assert_eq!(balance(&h, "alice").await, Balance::ZERO);
    }

    #[tokio::test]
    async fn test_amount_mismatch_keeps_row_pending() {
        let h = harness();
        let deposit = tx("fund_3", "alice", TransactionType::Deposit, Direction::Credit, dec!(500))
            .with_provider(ProviderKind::Simulated);
        h.ledger.create_pending(deposit).await.unwrap();

        let err = h
            .ledger
            .settle("fund_3", SettlementOutcome::Success, Some(dec!(5000)), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AmountMismatch { .. }));
        let stored = h.ledger.transaction("fund_3").await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert_eq!(h.store.audit_for("fund_3").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_optimistic_debit_failure_refunds() {
        let mut h = harness();
        fund(&h, "alice", dec!(100)).await;
        let bill = tx("bill_1", "alice", TransactionType::BillPayment, Direction::Debit, dec!(55))
            .with_provider(ProviderKind::Simulated);
        h.ledger.create_optimistic(bill).await.unwrap();
        assert_eq!(balance(&h, "alice").await, Balance::new(dec!(45)));

        let settlement = h
            .ledger
            .settle("bill_1", SettlementOutcome::Failure, None, "sweeper")
            .await
            .unwrap();
        assert_eq!(settlement.transaction.status, TransactionStatus::Failed);
        let refund = settlement.refund.unwrap();
        assert_eq!(refund.reference, "bill_1:refund");
        assert_eq!(refund.r#type, TransactionType::Refund);
        assert_eq!(refund.related_reference.as_deref(), Some("bill_1"));
        assert_eq!(balance(&h, "alice").await, Balance::new(dec!(100)));

        // the same failure again changes nothing
        let again = h
            .ledger
            .settle("bill_1", SettlementOutcome::Failure, None, "webhook")
            .await
            .unwrap();
        assert!(!again.changed);
        assert_eq!(balance(&h, "alice").await, Balance::new(dec!(100)));

        let mut statuses = Vec::new();
        while let Ok(Notice::User(n)) = h.notices.try_recv() {
            statuses.push((n.reference, n.status));
        }
        assert!(statuses.contains(&("bill_1".to_string(), TransactionStatus::Failed)));
        assert!(statuses.contains(&("bill_1:refund".to_string(), TransactionStatus::Completed)));
    }

    #[tokio::test]
    async fn test_send_moves_both_wallets_and_reverses_together() {
        let h = harness();
        fund(&h, "alice", dec!(1000)).await;
        let send = tx("send_1", "alice", TransactionType::Send, Direction::Debit, dec!(300));
        let (sent, received) = h.ledger.create_completed(send, "bob").await.unwrap();
        assert_eq!(received.reference, "send_1:receive");
        assert_eq!(sent.related_reference.as_deref(), Some("send_1:receive"));
        assert_eq!(balance(&h, "alice").await, Balance::new(dec!(700)));
        assert_eq!(balance(&h, "bob").await, Balance::new(dec!(300)));

        let reversal = h
            .ledger
            .reverse("send_1", "customer dispute", ReversalTarget::Refunded, "ops")
            .await
            .unwrap();
        assert_eq!(reversal.original.status, TransactionStatus::Refunded);
        let (receive, clawback) = reversal.counterpart.unwrap();
        assert_eq!(receive.status, TransactionStatus::Reversed);
        assert_eq!(clawback.direction, Direction::Debit);
        assert_eq!(balance(&h, "alice").await, Balance::new(dec!(1000)));
        assert_eq!(balance(&h, "bob").await, Balance::ZERO);

        let again = h
            .ledger
            .reverse("send_1", "customer dispute", ReversalTarget::Refunded, "ops")
            .await
            .unwrap();
        assert_eq!(again.refund.reference, "send_1:refund");
        assert_eq!(balance(&h, "alice").await, Balance::new(dec!(1000)));
    }

    #[tokio::test]
    async fn test_reverse_requires_completed() {
        let h = harness();
        let deposit = tx("fund_4", "alice", TransactionType::Deposit, Direction::Credit, dec!(10))
            .with_provider(ProviderKind::Simulated);
        h.ledger.create_pending(deposit).await.unwrap();
        let err = h
            .ledger
            .reverse("fund_4", "oops", ReversalTarget::Refunded, "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_adjustment_is_audited_and_floor_enforced() {
        let h = harness();
        let result = h
            .ledger
            .manual_correct(
                "admin@ops",
                Correction::AdjustBalance {
                    user_id: "alice".to_string(),
                    currency: Currency::ngn(),
                    delta: dec!(250),
                    reason: "goodwill credit".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.transaction.r#type, TransactionType::Adjustment);
        assert_eq!(result.audit.actor, "admin@ops");
        assert_eq!(result.audit.new_snapshot["balance"], json!(Balance::new(dec!(250))));
        assert_eq!(h.store.audit_for("alice:NGN").await.unwrap().len(), 1);

        let err = h
            .ledger
            .manual_correct(
                "admin@ops",
                Correction::AdjustBalance {
                    user_id: "alice".to_string(),
                    currency: Currency::ngn(),
                    delta: dec!(-251),
                    reason: "overdraw".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(h.store.audit_for("alice:NGN").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_escalates_once_at_budget() {
        let h = harness();
        let deposit = tx("fund_5", "alice", TransactionType::Deposit, Direction::Credit, dec!(10))
            .with_provider(ProviderKind::Simulated);
        h.ledger.create_pending(deposit).await.unwrap();

        let first = h.ledger.record_reconcile_failure("fund_5", 2, "timeout").await.unwrap();
        assert_eq!(first, ReconcileFailure { attempts: 1, escalated: false });
        let second = h.ledger.record_reconcile_failure("fund_5", 2, "timeout").await.unwrap();
        assert!(second.escalated);
        let third = h.ledger.record_reconcile_failure("fund_5", 2, "timeout").await.unwrap();
        assert!(!third.escalated);
        assert!(h.ledger.transaction("fund_5").await.unwrap().escalated);
    }
}

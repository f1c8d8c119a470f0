use crate::config::LimitsConfig;
use crate::domain::limits::{LimitDecision, LimitProfile, Usage};
use crate::domain::money::{Amount, Currency};
use crate::domain::ports::{SharedClock, SharedLedgerStore};
use crate::domain::transaction::{Direction, LimitKind, Transaction, TransactionStatus};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use tracing::debug;

/// Start of the current local day and month, in UTC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Windows {
    pub day_start: DateTime<Utc>,
    pub month_start: DateTime<Utc>,
}

/// Approves or rejects a proposed debit against a user's velocity limits.
///
/// Usage is derived from completed debits each time it is needed. The check is
/// advisory: two racing debits may both pass, and the balance floor enforced by the
/// store is what keeps the ledger correct.
pub struct LimitEvaluator {
    store: SharedLedgerStore,
    clock: SharedClock,
    config: LimitsConfig,
}

impl LimitEvaluator {
    pub fn new(store: SharedLedgerStore, clock: SharedClock, config: LimitsConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// The stored profile, or one built from the configured default.
    pub async fn profile(&self, user_id: &str) -> Result<LimitProfile> {
        if let Some(profile) = self.store.get_limit_profile(user_id).await? {
            return Ok(profile);
        }
        self.config
            .default_profile
            .as_ref()
            .map(|defaults| defaults.profile_for(user_id))
            .ok_or_else(|| LedgerError::NotFound(format!("limit profile for user {user_id}")))
    }

    pub fn windows(&self, now: DateTime<Utc>) -> Result<Windows> {
        let offset = FixedOffset::east_opt(self.config.utc_offset_minutes * 60).ok_or_else(|| {
            LedgerError::Config(format!(
                "invalid utc offset of {} minutes",
                self.config.utc_offset_minutes
            ))
        })?;
        let today = now.with_timezone(&offset).date_naive();
        let first_of_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
            .ok_or_else(|| LedgerError::Validation(format!("no first day for {today}")))?;
        Ok(Windows {
            day_start: local_midnight(today, offset)?,
            month_start: local_midnight(first_of_month, offset)?,
        })
    }

    /// Usage in the profile currency for the current day and month.
    pub async fn usage(&self, user_id: &str) -> Result<Usage> {
        let profile = self.profile(user_id).await?;
        self.usage_in(user_id, &profile.currency).await
    }

    async fn usage_in(&self, user_id: &str, currency: &Currency) -> Result<Usage> {
        let windows = self.windows(self.clock.now())?;
        let transactions = self
            .store
            .transactions_for_user(user_id, windows.month_start)
            .await?;

        let mut usage = Usage::default();
        for tx in transactions.iter().filter(|tx| counts_toward_limits(tx, currency)) {
            let amount = tx.amount.value();
            if tx.created_at >= windows.month_start {
                usage.month_total += amount;
            }
            if tx.created_at < windows.day_start {
                continue;
            }
            match tx.r#type.limit_kind() {
                Some(LimitKind::Send) => usage.sent_today += amount,
                Some(LimitKind::Spend) => usage.spent_today += amount,
                None => {}
            }
        }
        Ok(usage)
    }

    /// Daily ceiling first, then the monthly one.
    pub async fn check(
        &self,
        user_id: &str,
        amount: Amount,
        kind: LimitKind,
        currency: &Currency,
    ) -> Result<LimitDecision> {
        let profile = self.profile(user_id).await?;
        if &profile.currency != currency {
            return Ok(LimitDecision::Allowed);
        }

        let usage = self.usage_in(user_id, currency).await?;
        let (daily_limit, used_today) = match kind {
            LimitKind::Send => (profile.daily_send_limit, usage.sent_today),
            LimitKind::Spend => (profile.daily_spend_limit, usage.spent_today),
        };
        if used_today + amount.value() > daily_limit {
            debug!(user_id, ?kind, %amount, %used_today, "daily limit exceeded");
            return Ok(LimitDecision::LimitExceeded {
                limit: daily_limit,
                used: used_today,
            });
        }
        if usage.month_total + amount.value() > profile.monthly_limit {
            debug!(user_id, %amount, month_total = %usage.month_total, "monthly limit exceeded");
            return Ok(LimitDecision::LimitExceeded {
                limit: profile.monthly_limit,
                used: usage.month_total,
            });
        }
        Ok(LimitDecision::Allowed)
    }

    /// Like [`check`](Self::check), but a rejection becomes `LimitExceeded`.
    pub async fn ensure_allowed(
        &self,
        user_id: &str,
        amount: Amount,
        kind: LimitKind,
        currency: &Currency,
    ) -> Result<()> {
        match self.check(user_id, amount, kind, currency).await? {
            LimitDecision::Allowed => Ok(()),
            LimitDecision::LimitExceeded { limit, used } => {
                Err(LedgerError::LimitExceeded { limit, used })
            }
        }
    }
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> Result<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(offset).single())
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| LedgerError::Validation(format!("no local midnight on {date}")))
}

fn counts_toward_limits(tx: &Transaction, currency: &Currency) -> bool {
    tx.status == TransactionStatus::Completed
        && tx.direction == Direction::Debit
        && &tx.currency == currency
        && tx.r#type.limit_kind().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultLimits;
    use crate::domain::mutation::Mutation;
    use crate::domain::ports::LedgerStore;
    use crate::domain::transaction::TransactionType;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn evaluator(now: DateTime<Utc>) -> (LimitEvaluator, Arc<InMemoryLedgerStore>, ManualClock) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = ManualClock::new(now);
        let config = LimitsConfig {
            utc_offset_minutes: 60,
            default_profile: Some(DefaultLimits {
                currency: Currency::ngn(),
                daily_send_limit: dec!(1000),
                daily_spend_limit: dec!(200),
                monthly_limit: dec!(1500),
                kyc_level: 1,
            }),
        };
        let evaluator = LimitEvaluator::new(store.clone(), Arc::new(clock.clone()), config);
        (evaluator, store, clock)
    }

    async fn completed_debit(
        store: &InMemoryLedgerStore,
        reference: &str,
        r#type: TransactionType,
        amount: rust_decimal::Decimal,
        at: DateTime<Utc>,
    ) {
        let mut seed = Transaction::new(
            format!("{reference}:seed"),
            "alice",
            TransactionType::Deposit,
            Direction::Credit,
            Amount::new(amount).unwrap(),
            Currency::ngn(),
            at,
        );
        let mut tx = Transaction::new(
            reference,
            "alice",
            r#type,
            Direction::Debit,
            Amount::new(amount).unwrap(),
            Currency::ngn(),
            at,
        );
        tx.status = TransactionStatus::Completed;
        seed.status = TransactionStatus::Completed;
        let outcome = store
            .apply(Mutation::new().post(seed, true).post(tx, true))
            .await
            .unwrap();
        assert!(outcome.is_applied());
    }

    #[test]
    fn test_windows_use_local_midnight() {
        // 23:30 UTC on the 31st is already the 1st in Lagos
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 30, 0).unwrap();
        let (evaluator, _, _) = evaluator(now);
        let windows = evaluator.windows(now).unwrap();
        assert_eq!(
            windows.day_start,
            Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap()
        );
        assert_eq!(windows.month_start, windows.day_start);
    }

    #[tokio::test]
    async fn test_daily_send_limit() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let (evaluator, store, _) = evaluator(now);
        completed_debit(&store, "s1", TransactionType::Send, dec!(500), now).await;

        let decision = evaluator
            .check("alice", Amount::new(dec!(2000)).unwrap(), LimitKind::Send, &Currency::ngn())
            .await
            .unwrap();
        assert_eq!(
            decision,
            LimitDecision::LimitExceeded {
                limit: dec!(1000),
                used: dec!(500)
            }
        );

        let decision = evaluator
            .check("alice", Amount::new(dec!(500)).unwrap(), LimitKind::Send, &Currency::ngn())
            .await
            .unwrap();
        assert_eq!(decision, LimitDecision::Allowed);
    }

    #[tokio::test]
    async fn test_yesterday_only_counts_toward_month() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let (evaluator, store, _) = evaluator(now);
        completed_debit(
            &store,
            "old",
            TransactionType::BankTransfer,
            dec!(900),
            now - chrono::Duration::days(1),
        )
        .await;
        completed_debit(&store, "bill", TransactionType::BillPayment, dec!(150), now).await;

        let usage = evaluator.usage("alice").await.unwrap();
        assert_eq!(usage.sent_today, dec!(0));
        assert_eq!(usage.spent_today, dec!(150));
        assert_eq!(usage.month_total, dec!(1050));

        // daily send has room, the month does not
        let decision = evaluator
            .check("alice", Amount::new(dec!(600)).unwrap(), LimitKind::Send, &Currency::ngn())
            .await
            .unwrap();
        assert_eq!(
            decision,
            LimitDecision::LimitExceeded {
                limit: dec!(1500),
                used: dec!(1050)
            }
        );
    }

    #[tokio::test]
    async fn test_missing_profile_without_default() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let evaluator = LimitEvaluator::new(
            store,
            Arc::new(ManualClock::new(Utc::now())),
            LimitsConfig {
                utc_offset_minutes: 0,
                default_profile: None,
            },
        );
        assert!(matches!(
            evaluator.usage("ghost").await,
            Err(LedgerError::NotFound(_))
        ));
    }
}

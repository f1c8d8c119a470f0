//! Reconciliation sweeper.
//!
//! Pulls the outcome of provider-backed rows that no webhook has resolved and feeds
//! it through [`MutationService::settle`], the same path webhooks use. A provider
//! that cannot be reached is retried with backoff within a tick and again on the
//! next tick; after `max_attempts` failed ticks the row is escalated to an operator.
//! The sweeper never invents an outcome.

use crate::application::ledger::MutationService;
use crate::config::SweeperConfig;
use crate::domain::ports::{OperatorAlert, SharedClock, SharedLedgerStore, SharedNotifier};
use crate::domain::provider::ProviderOutcome;
use crate::domain::transaction::Transaction;
use crate::error::{ProviderError, Result};
use crate::infrastructure::providers::ProviderRegistry;
use backoff::ExponentialBackoff;
use backoff::future::retry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub settled: usize,
    pub still_pending: usize,
    pub errors: usize,
    pub escalated: usize,
}

pub struct ReconciliationSweeper {
    store: SharedLedgerStore,
    ledger: Arc<MutationService>,
    providers: ProviderRegistry,
    notifier: SharedNotifier,
    clock: SharedClock,
    config: SweeperConfig,
}

impl ReconciliationSweeper {
    pub fn new(
        store: SharedLedgerStore,
        ledger: Arc<MutationService>,
        providers: ProviderRegistry,
        notifier: SharedNotifier,
        clock: SharedClock,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            providers,
            notifier,
            clock,
            config,
        }
    }

    /// Runs ticks on `interval_secs` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_secs, "reconciliation sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconciliation sweeper stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("sweep failed: {e}");
                    }
                }
            }
        }
    }

    /// One pass over the stale rows. A row that cannot be reconciled is counted in
    /// `errors` and does not stop the rest of the batch.
    pub async fn tick(&self) -> Result<SweepReport> {
        let older_than = self.clock.now() - self.config.staleness();
        let stale = self
            .store
            .stale_transactions(older_than, self.config.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for tx in stale {
            report.checked += 1;
            if let Err(e) = self.reconcile(&tx, &mut report).await {
                error!(reference = %tx.reference, "reconciliation failed: {e}");
                report.errors += 1;
            }
        }

        if report.checked > 0 {
            info!(
                checked = report.checked,
                settled = report.settled,
                still_pending = report.still_pending,
                errors = report.errors,
                escalated = report.escalated,
                "sweep finished"
            );
        }
        Ok(report)
    }

    async fn reconcile(&self, tx: &Transaction, report: &mut SweepReport) -> Result<()> {
        let outcome = match self.verify(tx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(reference = %tx.reference, provider = ?tx.provider, "verify failed: {e}");
                report.errors += 1;
                return self.record_failure(tx, &e.to_string(), report).await;
            }
        };

        let Some(settlement) = outcome.status.settlement() else {
            debug!(reference = %tx.reference, "provider still reports pending");
            report.still_pending += 1;
            return Ok(());
        };

        match self
            .ledger
            .settle(&tx.reference, settlement, outcome.settled_amount, "sweeper")
            .await
        {
            Ok(_) => {
                report.settled += 1;
                Ok(())
            }
            Err(e) => {
                warn!(reference = %tx.reference, "settlement from sweep failed: {e}");
                report.errors += 1;
                self.record_failure(tx, &e.to_string(), report).await
            }
        }
    }

    async fn verify(&self, tx: &Transaction) -> std::result::Result<ProviderOutcome, ProviderError> {
        let kind = tx
            .provider
            .ok_or_else(|| ProviderError::Unsupported(format!("{} has no provider", tx.reference)))?;
        let adapter = self
            .providers
            .get(kind)
            .map_err(|e| ProviderError::Unsupported(e.to_string()))?;
        let provider_reference = tx
            .provider_reference
            .clone()
            .unwrap_or_else(|| tx.reference.clone());

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.retry_initial_ms),
            max_interval: Duration::from_millis(self.config.retry_initial_ms.saturating_mul(4)),
            max_elapsed_time: Some(Duration::from_millis(self.config.retry_max_elapsed_ms)),
            ..Default::default()
        };
        let adapter = &adapter;
        let provider_reference = provider_reference.as_str();
        retry(policy, move || async move {
            match adapter.verify(provider_reference).await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_retryable() => {
                    debug!(reference = %tx.reference, "retryable verify error: {e}");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn record_failure(&self, tx: &Transaction, reason: &str, report: &mut SweepReport) -> Result<()> {
        let failure = self
            .ledger
            .record_reconcile_failure(&tx.reference, self.config.max_attempts, reason)
            .await?;
        if failure.escalated {
            report.escalated += 1;
            error!(reference = %tx.reference, attempts = failure.attempts, "reconciliation escalated");
            let alert = OperatorAlert {
                reference: tx.reference.clone(),
                message: format!(
                    "could not reconcile after {} attempts: {reason}",
                    failure.attempts
                ),
            };
            if let Err(e) = self.notifier.alert(alert).await {
                warn!(reference = %tx.reference, "escalation alert failed: {e}");
            }
        }
        Ok(())
    }
}

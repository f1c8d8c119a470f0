use crate::application::ledger::{MutationService, Reversal, ReversalTarget};
use crate::domain::ports::{Notification, Notifier, OperatorAlert};
use crate::domain::transaction::{Transaction, TransactionType};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// What happens around every compensating row once it is committed, whichever path
/// produced it: the affected user hears about it, and large amounts page an operator.
#[derive(Debug, Clone)]
pub struct RefundPolicy {
    alert_threshold: Decimal,
}

impl RefundPolicy {
    pub fn new(alert_threshold: Decimal) -> Self {
        Self { alert_threshold }
    }

    pub(crate) async fn observe(&self, notifier: &dyn Notifier, refund: &Transaction) {
        info!(
            reference = %refund.reference,
            user_id = %refund.user_id,
            amount = %refund.amount,
            original = refund.related_reference.as_deref().unwrap_or_default(),
            "compensating transaction posted"
        );
        if let Err(e) = notifier.notify(Notification::from(refund)).await {
            warn!(reference = %refund.reference, "refund notification failed: {e}");
        }
        if refund.amount.value() > self.alert_threshold {
            let alert = OperatorAlert {
                reference: refund.reference.clone(),
                message: format!(
                    "refund of {} {} to {} exceeds the {} alert threshold",
                    refund.amount, refund.currency, refund.user_id, self.alert_threshold
                ),
            };
            if let Err(e) = notifier.alert(alert).await {
                warn!(reference = %refund.reference, "refund alert failed: {e}");
            }
        }
    }
}

/// User- and operator-requested refunds of completed transactions.
pub struct RefundEngine {
    ledger: Arc<MutationService>,
}

impl RefundEngine {
    pub fn new(ledger: Arc<MutationService>) -> Self {
        Self { ledger }
    }

    pub async fn refund(&self, reference: &str, reason: &str, actor: &str) -> Result<Reversal> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation("a refund needs a reason".to_string()));
        }
        let original = self.ledger.transaction(reference).await?;
        match original.r#type {
            TransactionType::Refund | TransactionType::Adjustment => {
                return Err(LedgerError::Validation(format!(
                    "{reference} is a {:?} row and cannot be refunded",
                    original.r#type
                )));
            }
            TransactionType::Receive => {
                return Err(LedgerError::Validation(format!(
                    "{reference} is the receiving side; refund {} instead",
                    original.related_reference.as_deref().unwrap_or("the send")
                )));
            }
            _ => {}
        }
        self.ledger
            .reverse(reference, reason, ReversalTarget::Refunded, actor)
            .await
    }
}

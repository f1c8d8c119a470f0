use super::money::{Amount, Balance, Currency};
use super::provider::ProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Send,
    Receive,
    Deposit,
    BillPayment,
    BankTransfer,
    CardFunding,
    GiftCard,
    Remittance,
    Refund,
    Adjustment,
}

/// Which limit bucket a debit counts against.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Send,
    Spend,
}

impl TransactionType {
    pub fn limit_kind(&self) -> Option<LimitKind> {
        match self {
            TransactionType::Send | TransactionType::BankTransfer | TransactionType::Remittance => {
                Some(LimitKind::Send)
            }
            TransactionType::BillPayment | TransactionType::GiftCard => Some(LimitKind::Spend),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    Reversed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Legal edges of the transaction state machine.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, RolledBack)
                | (Completed, Refunded)
                | (Completed, Reversed)
                | (Completed, Failed)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        }
    }

    /// Signed balance effect of moving `amount` in this direction.
    pub fn signed(&self, amount: Amount) -> Balance {
        match self {
            Direction::Credit => amount.into(),
            Direction::Debit => -Balance::from(amount),
        }
    }
}

/// An immutable, status-tracked monetary event.
///
/// `reference` is the idempotency key. `amount` never changes after creation; the
/// store bumps `version` on every write so callers can apply conditionally.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub reference: String,
    pub user_id: String,
    pub counterparty_id: Option<String>,
    pub r#type: TransactionType,
    pub direction: Direction,
    pub amount: Amount,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub provider: Option<ProviderKind>,
    pub provider_reference: Option<String>,
    /// The balance effect of this row has been applied to the wallet.
    #[serde(default)]
    pub posted: bool,
    /// The provider has confirmed an optimistically applied debit.
    #[serde(default)]
    pub confirmed: bool,
    pub related_reference: Option<String>,
    #[serde(default)]
    pub reconcile_attempts: u32,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub version: u64,
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        reference: impl Into<String>,
        user_id: impl Into<String>,
        r#type: TransactionType,
        direction: Direction,
        amount: Amount,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference: reference.into(),
            user_id: user_id.into(),
            counterparty_id: None,
            r#type,
            direction,
            amount,
            currency,
            status: TransactionStatus::Pending,
            provider: None,
            provider_reference: None,
            posted: false,
            confirmed: false,
            related_reference: None,
            reconcile_attempts: 0,
            escalated: false,
            version: 0,
            description: String::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_counterparty(mut self, counterparty_id: impl Into<String>) -> Self {
        self.counterparty_id = Some(counterparty_id.into());
        self
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Signed effect this row has on its wallet once posted.
    pub fn balance_effect(&self) -> Balance {
        self.direction.signed(self.amount)
    }

    /// Debits posted before the provider confirmed them.
    pub fn awaiting_confirmation(&self) -> bool {
        self.status == TransactionStatus::Completed
            && self.posted
            && !self.confirmed
            && self.provider.is_some()
    }

    /// Reference of the compensating `refund` row for this transaction.
    pub fn refund_reference(&self) -> String {
        format!("{}:refund", self.reference)
    }
}

/// Generates a caller-facing reference when the caller does not supply one.
pub fn generate_reference(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_state_machine_edges() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Refunded));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!RolledBack.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
    }

    #[test]
    fn test_balance_effect_sign() {
        let amount = Amount::new(dec!(300)).unwrap();
        let now = Utc::now();
        let debit = Transaction::new(
            "ref-1",
            "alice",
            TransactionType::Send,
            Direction::Debit,
            amount,
            Currency::ngn(),
            now,
        );
        assert_eq!(debit.balance_effect(), Balance::new(dec!(-300)));
        assert_eq!(debit.direction.opposite(), Direction::Credit);
        assert_eq!(debit.refund_reference(), "ref-1:refund");
    }

    #[test]
    fn test_transaction_serialization() {
        let tx = Transaction::new(
            "ref-2",
            "bob",
            TransactionType::BillPayment,
            Direction::Debit,
            Amount::new(dec!(55)).unwrap(),
            Currency::ngn(),
            Utc::now(),
        )
        .with_provider(ProviderKind::Flutterwave);

        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "bill_payment");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["provider"], "flutterwave");

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_limit_kinds() {
        assert_eq!(TransactionType::Send.limit_kind(), Some(LimitKind::Send));
        assert_eq!(
            TransactionType::BillPayment.limit_kind(),
            Some(LimitKind::Spend)
        );
        assert_eq!(TransactionType::Deposit.limit_kind(), None);
    }
}

use super::money::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Velocity ceilings for one user, expressed in `currency`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LimitProfile {
    pub user_id: String,
    pub currency: Currency,
    pub daily_send_limit: Decimal,
    pub daily_spend_limit: Decimal,
    pub monthly_limit: Decimal,
    pub kyc_level: u8,
}

/// Derived usage, aggregated from completed debits. Display only.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Usage {
    pub sent_today: Decimal,
    pub spent_today: Decimal,
    pub month_total: Decimal,
}

#[derive(Debug, PartialEq, Clone)]
pub enum LimitDecision {
    Allowed,
    LimitExceeded { limit: Decimal, used: Decimal },
}

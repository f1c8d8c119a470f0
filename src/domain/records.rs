use super::provider::ProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Accepted,
    SignatureInvalid,
    Malformed,
}

/// Append-only audit of an inbound provider callback.
///
/// Records with an `event_id` double as the deduplication set.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WebhookRecord {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub event_id: Option<String>,
    pub payload: String,
    pub outcome: WebhookOutcome,
    pub received_at: DateTime<Utc>,
}

impl WebhookRecord {
    pub fn new(
        provider: ProviderKind,
        event_id: Option<String>,
        payload: &[u8],
        outcome: WebhookOutcome,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            event_id,
            payload: String::from_utf8_lossy(payload).into_owned(),
            outcome,
            received_at,
        }
    }

    /// Deduplication key, if the provider supplied an event id.
    pub fn dedup_key(&self) -> Option<String> {
        self.event_id
            .as_ref()
            .map(|event_id| format!("{}:{}", self.provider, event_id))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ManualAdjustment,
    ManualSettlement,
    Anomaly,
    Reversal,
    Escalation,
}

/// Links the cause of a correction or anomaly to its effect.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor: String,
    pub target_type: String,
    pub target_id: String,
    pub old_snapshot: serde_json::Value,
    pub new_snapshot: serde_json::Value,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        actor: impl Into<String>,
        target_type: &str,
        target_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor: actor.into(),
            target_type: target_type.to_string(),
            target_id: target_id.into(),
            old_snapshot: serde_json::Value::Null,
            new_snapshot: serde_json::Value::Null,
            reason: String::new(),
            created_at,
        }
    }

    pub fn with_snapshots(mut self, old: serde_json::Value, new: serde_json::Value) -> Self {
        self.old_snapshot = old;
        self.new_snapshot = new;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

//! Flutterwave adapter: funding, bank payouts and bill payments.
//!
//! Amounts travel in major units. Webhooks are authenticated by the `verif-hash`
//! header, which must equal the secret hash configured on the dashboard.
//! Provider references are prefixed with the resource they verify against
//! (`charge:`, `transfer:`, `bill:`).

use super::secrets_match;
use crate::domain::ports::PaymentProvider;
use crate::domain::provider::{
    Destination, InitializeRequest, Initialized, ProviderKind, ProviderOutcome, ProviderStatus,
    TransferReceipt, TransferRequest, WebhookEvent, WebhookRequest,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const FLUTTERWAVE_API_URL: &str = "https://api.flutterwave.com";
pub const SIGNATURE_HEADER: &str = "verif-hash";

pub fn map_status(status: &str) -> ProviderStatus {
    match status.to_ascii_lowercase().as_str() {
        "successful" | "success" => ProviderStatus::Successful,
        "failed" | "cancelled" | "error" => ProviderStatus::Failed,
        _ => ProviderStatus::Pending,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct Customer {
    email: String,
}

#[derive(Debug, Serialize)]
struct PaymentBody<'a> {
    tx_ref: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    currency: &'a str,
    customer: Customer,
}

#[derive(Debug, Deserialize)]
struct PaymentData {
    link: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
    amount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
struct TransferBody<'a> {
    account_bank: &'a str,
    account_number: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    narration: &'a str,
    currency: &'a str,
    reference: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    id: u64,
    status: String,
}

#[derive(Debug, Serialize)]
struct BillBody<'a> {
    country: &'static str,
    customer: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    r#type: &'a str,
    reference: &'a str,
}

#[derive(Debug, Deserialize)]
struct BillData {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    event: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    id: serde_json::Value,
    tx_ref: Option<String>,
    reference: Option<String>,
    amount: Option<Decimal>,
    status: String,
}

pub struct FlutterwaveProvider {
    client: Client,
    base_url: String,
    secret_key: String,
    webhook_hash: String,
}

impl FlutterwaveProvider {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        webhook_hash: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::from)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            webhook_hash: webhook_hash.into(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let envelope: Envelope<T> = request
            .bearer_auth(&self.secret_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if envelope.status != "success" {
            return Err(ProviderError::Rejected(envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| ProviderError::Malformed(format!("no data: {}", envelope.message)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PaymentProvider for FlutterwaveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Flutterwave
    }

    async fn initialize(&self, request: &InitializeRequest) -> Result<Initialized, ProviderError> {
        let body = PaymentBody {
            tx_ref: &request.reference,
            amount: request.amount.value(),
            currency: request.currency.as_str(),
            customer: Customer {
                email: request
                    .payer
                    .email
                    .clone()
                    .unwrap_or_else(|| format!("{}@wallet.invalid", request.payer.user_id)),
            },
        };
        debug!(reference = %request.reference, "flutterwave initialize");
        let data: PaymentData = self
            .call(self.client.post(self.url("/v3/payments")).json(&body))
            .await?;
        Ok(Initialized {
            provider_reference: format!("charge:{}", request.reference),
            handle: data.link,
        })
    }

    async fn verify(&self, provider_reference: &str) -> Result<ProviderOutcome, ProviderError> {
        let request = match provider_reference.split_once(':') {
            Some(("charge", tx_ref)) => self
                .client
                .get(self.url("/v3/transactions/verify_by_reference"))
                .query(&[("tx_ref", tx_ref)]),
            Some(("transfer", id)) => self.client.get(self.url(&format!("/v3/transfers/{id}"))),
            Some(("bill", reference)) => {
                self.client.get(self.url(&format!("/v3/bills/{reference}")))
            }
            _ => {
                return Err(ProviderError::Malformed(format!(
                    "unrecognised provider reference '{provider_reference}'"
                )));
            }
        };
        let data: VerifyData = self.call(request).await?;
        Ok(ProviderOutcome {
            status: map_status(&data.status),
            settled_amount: data.amount,
        })
    }

    async fn push_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ProviderError> {
        match &request.destination {
            Destination::BankAccount {
                bank_code,
                account_number,
                ..
            } => {
                let data: TransferData = self
                    .call(self.client.post(self.url("/v3/transfers")).json(&TransferBody {
                        account_bank: bank_code,
                        account_number,
                        amount: request.amount.value(),
                        narration: &request.narration,
                        currency: request.currency.as_str(),
                        reference: &request.reference,
                    }))
                    .await?;
                Ok(TransferReceipt {
                    provider_reference: format!("transfer:{}", data.id),
                    status: map_status(&data.status),
                })
            }
            Destination::Biller { biller, customer } => {
                let data: BillData = self
                    .call(self.client.post(self.url("/v3/bills")).json(&BillBody {
                        country: "NG",
                        customer,
                        amount: request.amount.value(),
                        r#type: biller,
                        reference: &request.reference,
                    }))
                    .await?;
                // bills are only accepted here; the outcome arrives later
                let status = data
                    .status
                    .as_deref()
                    .map(map_status)
                    .unwrap_or(ProviderStatus::Pending);
                Ok(TransferReceipt {
                    provider_reference: format!("bill:{}", request.reference),
                    status,
                })
            }
        }
    }

    fn authenticate_webhook(&self, request: &WebhookRequest) -> bool {
        !self.webhook_hash.is_empty()
            && request
                .header(SIGNATURE_HEADER)
                .is_some_and(|hash| secrets_match(hash, &self.webhook_hash))
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<WebhookEvent, ProviderError> {
        let parsed: WebhookBody =
            serde_json::from_slice(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let reference = parsed
            .data
            .tx_ref
            .or(parsed.data.reference)
            .ok_or_else(|| ProviderError::Malformed("callback carries no reference".to_string()))?;
        let id = match &parsed.data.id {
            serde_json::Value::String(id) => id.clone(),
            other => other.to_string(),
        };
        Ok(WebhookEvent {
            event_id: format!("{}:{}", parsed.event, id),
            reference,
            amount: parsed.data.amount,
            status: map_status(&parsed.data.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn provider() -> FlutterwaveProvider {
        FlutterwaveProvider::new(
            FLUTTERWAVE_API_URL,
            "FLWSECK_TEST",
            "hash-123",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(map_status("successful"), ProviderStatus::Successful);
        assert_eq!(map_status("SUCCESSFUL"), ProviderStatus::Successful);
        assert_eq!(map_status("cancelled"), ProviderStatus::Failed);
        assert_eq!(map_status("NEW"), ProviderStatus::Pending);
    }

    #[test]
    fn test_verif_hash() {
        let provider = provider();
        let body = b"{}".to_vec();
        assert!(provider.authenticate_webhook(
            &WebhookRequest::new(body.clone()).with_header(SIGNATURE_HEADER, "hash-123")
        ));
        assert!(!provider.authenticate_webhook(
            &WebhookRequest::new(body.clone()).with_header(SIGNATURE_HEADER, "hash-124")
        ));
        assert!(!provider.authenticate_webhook(&WebhookRequest::new(body)));
    }

    #[test]
    fn test_parse_charge_and_transfer_events() {
        let provider = provider();
        let charge = br#"{"event":"charge.completed","data":{"id":285959875,"tx_ref":"fund_9","amount":500,"status":"successful"}}"#;
        let event = provider.parse_webhook(charge).unwrap();
        assert_eq!(event.event_id, "charge.completed:285959875");
        assert_eq!(event.reference, "fund_9");
        assert_eq!(event.amount, Some(dec!(500)));
        assert_eq!(event.status, ProviderStatus::Successful);

        let transfer = br#"{"event":"transfer.completed","data":{"id":"11","reference":"wd_4","amount":20,"status":"FAILED"}}"#;
        let event = provider.parse_webhook(transfer).unwrap();
        assert_eq!(event.reference, "wd_4");
        assert_eq!(event.status, ProviderStatus::Failed);

        let orphan = br#"{"event":"charge.completed","data":{"id":1,"status":"successful"}}"#;
        assert!(matches!(
            provider.parse_webhook(orphan),
            Err(ProviderError::Malformed(_))
        ));
    }
}

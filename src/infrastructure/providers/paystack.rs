//! Paystack adapter: card/bank funding and bank payouts.
//!
//! Amounts travel in kobo. Webhooks carry `x-paystack-signature`, the hex
//! HMAC-SHA512 of the raw body under the secret key.

use super::verify_hex;
use crate::domain::money::Amount;
use crate::domain::ports::PaymentProvider;
use crate::domain::provider::{
    Destination, InitializeRequest, Initialized, ProviderKind, ProviderOutcome, ProviderStatus,
    TransferReceipt, TransferRequest, WebhookEvent, WebhookRequest,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use hmac::Hmac;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::time::Duration;
use tracing::debug;

pub const PAYSTACK_API_URL: &str = "https://api.paystack.co";
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";
/// Paystack transfer codes; anything else is verified as a charge reference.
const TRANSFER_CODE_PREFIX: &str = "TRF_";

/// Maps Paystack charge and transfer statuses onto the normalized status.
pub fn map_status(status: &str) -> ProviderStatus {
    match status.to_ascii_lowercase().as_str() {
        "success" => ProviderStatus::Successful,
        "failed" | "reversed" | "abandoned" | "rejected" => ProviderStatus::Failed,
        _ => ProviderStatus::Pending,
    }
}

fn from_kobo(kobo: i64) -> Decimal {
    Decimal::new(kobo, 2)
}

/// Nothing is sent when the amount cannot be quoted exactly.
fn kobo(amount: Amount) -> Result<i64, ProviderError> {
    amount
        .to_minor_units()
        .map_err(|e| ProviderError::Rejected(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct InitializeBody<'a> {
    email: String,
    amount: i64,
    currency: &'a str,
    reference: &'a str,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
    amount: i64,
}

#[derive(Debug, Serialize)]
struct RecipientBody<'a> {
    r#type: &'static str,
    name: &'a str,
    account_number: &'a str,
    bank_code: &'a str,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct RecipientData {
    recipient_code: String,
}

#[derive(Debug, Serialize)]
struct TransferBody<'a> {
    source: &'static str,
    amount: i64,
    recipient: &'a str,
    reason: &'a str,
    reference: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    transfer_code: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    event: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    id: serde_json::Value,
    reference: String,
    amount: Option<i64>,
    status: Option<String>,
}

pub struct PaystackProvider {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl PaystackProvider {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
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
        if !envelope.status {
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
impl PaymentProvider for PaystackProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Paystack
    }

    async fn initialize(&self, request: &InitializeRequest) -> Result<Initialized, ProviderError> {
        let amount = kobo(request.amount)?;
        let body = InitializeBody {
            email: request
                .payer
                .email
                .clone()
                .unwrap_or_else(|| format!("{}@wallet.invalid", request.payer.user_id)),
            amount,
            currency: request.currency.as_str(),
            reference: &request.reference,
        };
        debug!(reference = %request.reference, "paystack initialize");
        let data: InitializeData = self
            .call(self.client.post(self.url("/transaction/initialize")).json(&body))
            .await?;
        Ok(Initialized {
            provider_reference: data.reference,
            handle: data.authorization_url,
        })
    }

    async fn verify(&self, provider_reference: &str) -> Result<ProviderOutcome, ProviderError> {
        let path = if provider_reference.starts_with(TRANSFER_CODE_PREFIX) {
            format!("/transfer/{provider_reference}")
        } else {
            format!("/transaction/verify/{provider_reference}")
        };
        let data: VerifyData = self.call(self.client.get(self.url(&path))).await?;
        Ok(ProviderOutcome {
            status: map_status(&data.status),
            settled_amount: Some(from_kobo(data.amount)),
        })
    }

    async fn push_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ProviderError> {
        let Destination::BankAccount {
            bank_code,
            account_number,
            account_name,
        } = &request.destination
        else {
            return Err(ProviderError::Unsupported(
                "paystack does not settle bill payments".to_string(),
            ));
        };

        let amount = kobo(request.amount)?;
        let recipient: RecipientData = self
            .call(
                self.client
                    .post(self.url("/transferrecipient"))
                    .json(&RecipientBody {
                        r#type: "nuban",
                        name: account_name.as_deref().unwrap_or(account_number),
                        account_number,
                        bank_code,
                        currency: request.currency.as_str(),
                    }),
            )
            .await?;

        let data: TransferData = self
            .call(self.client.post(self.url("/transfer")).json(&TransferBody {
                source: "balance",
                amount,
                recipient: &recipient.recipient_code,
                reason: &request.narration,
                reference: &request.reference,
            }))
            .await?;
        Ok(TransferReceipt {
            provider_reference: data.transfer_code,
            status: map_status(&data.status),
        })
    }

    fn authenticate_webhook(&self, request: &WebhookRequest) -> bool {
        request.header(SIGNATURE_HEADER).is_some_and(|signature| {
            verify_hex::<Hmac<Sha512>>(self.secret_key.as_bytes(), &request.body, signature)
        })
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<WebhookEvent, ProviderError> {
        let parsed: WebhookBody =
            serde_json::from_slice(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let status = match parsed.event.as_str() {
            "charge.success" | "transfer.success" => ProviderStatus::Successful,
            "charge.failed" | "transfer.failed" | "transfer.reversed" => ProviderStatus::Failed,
            _ => parsed
                .data
                .status
                .as_deref()
                .map(map_status)
                .unwrap_or(ProviderStatus::Pending),
        };
        let id = match &parsed.data.id {
            serde_json::Value::String(id) => id.clone(),
            other => other.to_string(),
        };
        Ok(WebhookEvent {
            event_id: format!("{}:{}", parsed.event, id),
            reference: parsed.data.reference,
            amount: parsed.data.amount.map(from_kobo),
            status,
        })
    }
}

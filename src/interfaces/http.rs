//! HTTP surface of the ledger.
//!
//! | Method | Path                              | Description                          |
//! |--------|-----------------------------------|--------------------------------------|
//! | GET    | `/health`                         | Liveness probe                       |
//! | POST   | `/webhooks/:provider`             | Provider callback (raw signed body)  |
//! | POST   | `/v1/transfers`                   | Wallet-to-wallet send                |
//! | POST   | `/v1/fundings`                    | Card or bank-transfer funding        |
//! | POST   | `/v1/bills`                       | Bill payment                         |
//! | POST   | `/v1/withdrawals`                 | Withdrawal to a bank account         |
//! | POST   | `/v1/refunds`                     | Refund a completed transaction       |
//! | GET    | `/v1/users/:user_id/usage`        | Limit usage for the current windows  |
//! | GET    | `/v1/wallets/:user_id/:currency`  | Wallet balance                       |
//! | POST   | `/v1/admin/corrections`           | Audited manual correction            |

use crate::application::ledger::{Correction, CorrectionResult};
use crate::application::payments::{
    BillRequest, FundRequest, MutationReceipt, PaymentService, RefundRequest, SendRequest,
    WithdrawRequest,
};
use crate::application::webhook::{WebhookIngestion, WebhookResponse};
use crate::domain::limits::Usage;
use crate::domain::money::Currency;
use crate::domain::provider::{ProviderKind, WebhookRequest};
use crate::domain::wallet::Wallet;
use crate::error::LedgerError;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Header carrying the operator or service on whose behalf a call is made.
pub const ACTOR_HEADER: &str = "x-actor";

#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<PaymentService>,
    pub webhooks: Arc<WebhookIngestion>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/:provider", post(webhook))
        .route("/v1/transfers", post(send))
        .route("/v1/fundings", post(fund))
        .route("/v1/bills", post(pay_bill))
        .route("/v1/withdrawals", post(withdraw))
        .route("/v1/refunds", post(refund))
        .route("/v1/users/:user_id/usage", get(usage))
        .route("/v1/wallets/:user_id/:currency", get(wallet))
        .route("/v1/admin/corrections", post(correct))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A [`LedgerError`] rendered as `{error, message}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(LedgerError::Validation(rejection.body_text()))
    }
}

pub fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Validation(_) | LedgerError::AmountMismatch { .. } => StatusCode::BAD_REQUEST,
        LedgerError::InsufficientFunds { .. } | LedgerError::LimitExceeded { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InvalidTransition { .. } | LedgerError::DuplicateReference(_) => {
            StatusCode::CONFLICT
        }
        LedgerError::Provider(_) => StatusCode::BAD_GATEWAY,
        LedgerError::SignatureInvalid => StatusCode::UNAUTHORIZED,
        LedgerError::Config(_)
        | LedgerError::Csv(_)
        | LedgerError::Io(_)
        | LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_kind(err: &LedgerError) -> &'static str {
    match err {
        LedgerError::Validation(_) => "validation",
        LedgerError::InsufficientFunds { .. } => "insufficient_funds",
        LedgerError::NotFound(_) => "not_found",
        LedgerError::LimitExceeded { .. } => "limit_exceeded",
        LedgerError::DuplicateReference(_) => "duplicate_reference",
        LedgerError::Provider(_) => "provider_error",
        LedgerError::SignatureInvalid => "signature_invalid",
        LedgerError::InvalidTransition { .. } => "invalid_transition",
        LedgerError::AmountMismatch { .. } => "amount_mismatch",
        LedgerError::Config(_) | LedgerError::Csv(_) | LedgerError::Io(_) | LedgerError::Storage(_) => {
            "internal"
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }
        let body = match &self.0 {
            LedgerError::LimitExceeded { limit, used } => json!({
                "error": error_kind(&self.0),
                "message": self.0.to_string(),
                "limit": limit,
                "used": used,
            }),
            // internals stay in the log
            err if status.is_server_error() => json!({
                "error": error_kind(err),
                "message": "internal error",
            }),
            err => json!({
                "error": error_kind(err),
                "message": err.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let provider: ProviderKind = provider.parse()?;
    let mut request = WebhookRequest::new(body.to_vec());
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    let response = state.webhooks.handle(provider, request).await?;
    let status =
        StatusCode::from_u16(response.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match response {
        WebhookResponse::Processed => json!({ "result": "processed" }),
        WebhookResponse::Duplicate => json!({ "result": "duplicate" }),
        WebhookResponse::Unauthorized => json!({ "error": "signature_invalid" }),
        WebhookResponse::BadRequest(message) => json!({ "error": "bad_request", "message": message }),
    };
    Ok((status, Json(body)).into_response())
}

async fn send(
    State(state): State<AppState>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult<MutationReceipt> {
    let Json(request) = payload?;
    Ok(Json(state.payments.send(request).await?))
}

async fn fund(
    State(state): State<AppState>,
    payload: Result<Json<FundRequest>, JsonRejection>,
) -> ApiResult<MutationReceipt> {
    let Json(request) = payload?;
    Ok(Json(state.payments.fund(request).await?))
}

async fn pay_bill(
    State(state): State<AppState>,
    payload: Result<Json<BillRequest>, JsonRejection>,
) -> ApiResult<MutationReceipt> {
    let Json(request) = payload?;
    Ok(Json(state.payments.pay_bill(request).await?))
}

async fn withdraw(
    State(state): State<AppState>,
    payload: Result<Json<WithdrawRequest>, JsonRejection>,
) -> ApiResult<MutationReceipt> {
    let Json(request) = payload?;
    Ok(Json(state.payments.withdraw(request).await?))
}

async fn refund(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> ApiResult<MutationReceipt> {
    let Json(request) = payload?;
    let actor = actor(&headers).unwrap_or("api");
    Ok(Json(state.payments.refund(request, actor).await?))
}

async fn usage(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult<Usage> {
    Ok(Json(state.payments.get_usage(&user_id).await?))
}

async fn wallet(
    State(state): State<AppState>,
    Path((user_id, currency)): Path<(String, String)>,
) -> ApiResult<Wallet> {
    let currency = Currency::new(&currency)?;
    Ok(Json(state.payments.wallet(&user_id, &currency).await?))
}

async fn correct(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Correction>, JsonRejection>,
) -> ApiResult<CorrectionResult> {
    let actor = actor(&headers)
        .ok_or_else(|| LedgerError::Validation(format!("{ACTOR_HEADER} header is required")))?
        .to_string();
    let Json(correction) = payload?;
    Ok(Json(
        state.payments.ledger().manual_correct(&actor, correction).await?,
    ))
}

fn actor(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|actor| !actor.is_empty())
}

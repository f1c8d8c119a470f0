//! Configuration loading and validation

use crate::domain::limits::LimitProfile;
use crate::domain::money::Currency;
use crate::domain::provider::ProviderKind;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variables override file values, e.g. `WALLET_LEDGER__SWEEPER__MAX_ATTEMPTS=8`.
pub const ENV_PREFIX: &str = "WALLET_LEDGER";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub refunds: RefundConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Rows younger than this are left to webhooks.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,
    /// Failed polls before a row is escalated to an operator.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            staleness_secs: default_staleness_secs(),
            max_attempts: default_max_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_elapsed_ms: default_retry_max_elapsed_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs)
    }
}

/// Template applied to users without a stored limit profile.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DefaultLimits {
    pub currency: Currency,
    pub daily_send_limit: Decimal,
    pub daily_spend_limit: Decimal,
    pub monthly_limit: Decimal,
    pub kyc_level: u8,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            currency: Currency::ngn(),
            daily_send_limit: dec!(50000),
            daily_spend_limit: dec!(50000),
            monthly_limit: dec!(300000),
            kyc_level: 1,
        }
    }
}

impl DefaultLimits {
    pub fn profile_for(&self, user_id: &str) -> LimitProfile {
        LimitProfile {
            user_id: user_id.to_string(),
            currency: self.currency.clone(),
            daily_send_limit: self.daily_send_limit,
            daily_spend_limit: self.daily_spend_limit,
            monthly_limit: self.monthly_limit,
            kyc_level: self.kyc_level,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Offset of the local day boundary from UTC (Lagos is +60).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    /// `None` makes a missing limit profile a `NotFound` error.
    #[serde(default = "default_profile")]
    pub default_profile: Option<DefaultLimits>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            default_profile: default_profile(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundConfig {
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: Decimal,
}

impl Default for RefundConfig {
    fn default() -> Self {
        Self {
            alert_threshold: default_alert_threshold(),
        }
    }
}

/// Which provider backs each flow.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_simulated")]
    pub funding: ProviderKind,
    #[serde(default = "default_simulated")]
    pub transfers: ProviderKind,
    #[serde(default = "default_simulated")]
    pub bills: ProviderKind,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            funding: default_simulated(),
            transfers: default_simulated(),
            bills: default_simulated(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub paystack: Option<PaystackConfig>,
    #[serde(default)]
    pub flutterwave: Option<FlutterwaveConfig>,
    #[serde(default)]
    pub simulated: Option<SimulatedConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            paystack: None,
            flutterwave: None,
            simulated: Some(SimulatedConfig::default()),
        }
    }
}

impl ProvidersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaystackConfig {
    #[serde(default = "default_paystack_url")]
    pub base_url: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlutterwaveConfig {
    #[serde(default = "default_flutterwave_url")]
    pub base_url: String,
    pub secret_key: String,
    pub webhook_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedConfig {
    #[serde(default = "default_simulated_secret")]
    pub webhook_secret: String,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            webhook_secret: default_simulated_secret(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

fn default_staleness_secs() -> i64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    200
}

fn default_retry_max_elapsed_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    100
}

fn default_utc_offset_minutes() -> i32 {
    60
}

fn default_profile() -> Option<DefaultLimits> {
    Some(DefaultLimits::default())
}

fn default_alert_threshold() -> Decimal {
    dec!(100000)
}

fn default_simulated() -> ProviderKind {
    ProviderKind::Simulated
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_paystack_url() -> String {
    crate::infrastructure::providers::paystack::PAYSTACK_API_URL.to_string()
}

fn default_flutterwave_url() -> String {
    crate::infrastructure::providers::flutterwave::FLUTTERWAVE_API_URL.to_string()
}

fn default_simulated_secret() -> String {
    "simulated-secret".to_string()
}

impl Settings {
    /// Load configuration from an optional file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.sweeper.interval_secs == 0 {
            return Err(LedgerError::Config("sweeper.interval_secs must be positive".into()));
        }
        if self.sweeper.staleness_secs < 0 {
            return Err(LedgerError::Config("sweeper.staleness_secs cannot be negative".into()));
        }
        if self.sweeper.max_attempts == 0 {
            return Err(LedgerError::Config("sweeper.max_attempts must be at least 1".into()));
        }
        if self.limits.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(LedgerError::Config(
                "limits.utc_offset_minutes must be within one day".into(),
            ));
        }
        if let Some(profile) = &self.limits.default_profile
            && (profile.daily_send_limit < Decimal::ZERO
                || profile.daily_spend_limit < Decimal::ZERO
                || profile.monthly_limit < Decimal::ZERO)
        {
            return Err(LedgerError::Config("limits cannot be negative".into()));
        }
        if self.refunds.alert_threshold <= Decimal::ZERO {
            return Err(LedgerError::Config("refunds.alert_threshold must be positive".into()));
        }

        for (flow, kind) in [
            ("funding", self.routing.funding),
            ("transfers", self.routing.transfers),
            ("bills", self.routing.bills),
        ] {
            let configured = match kind {
                ProviderKind::Paystack => self.providers.paystack.is_some(),
                ProviderKind::Flutterwave => self.providers.flutterwave.is_some(),
                ProviderKind::Simulated => self.providers.simulated.is_some(),
            };
            if !configured {
                return Err(LedgerError::Config(format!(
                    "routing.{flow} uses {kind}, which has no [providers.{kind}] section"
                )));
            }
        }
        if self.routing.bills == ProviderKind::Paystack {
            return Err(LedgerError::Config("paystack cannot settle bill payments".into()));
        }

        if self.routing.funding == ProviderKind::Simulated
            || self.routing.transfers == ProviderKind::Simulated
            || self.routing.bills == ProviderKind::Simulated
        {
            tracing::warn!("Simulated provider is routed - no real money will move");
        }

        Ok(())
    }
}

//! Application configuration.

use crate::error::{AppError, AppResult};
use relay_core::{Subscriber, SubscriberId};
use relay_exchange::DEFAULT_INFO_URL;
use relay_executor::{BatchConfig, BracketConfig, RetryPolicy, TradingLoopConfig};
use relay_position::MonitorConfig;
use relay_telemetry::EmailConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Simulated accounts on live market data.
    #[default]
    Paper,
    /// Real accounts through an exchange session factory.
    Live,
}

// ============================================================================
// Trading
// ============================================================================

/// Trading loop and bracket execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Seconds between delivery polls. Default: 10.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Deliveries executed concurrently. Default: 25.
    #[serde(default = "default_trading_batch_size")]
    pub batch_size: usize,
    /// Pause between batches (ms). Default: 50.
    #[serde(default = "default_trading_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Signals older than this are never executed. Default: 15.
    #[serde(default = "default_signal_expiry_minutes")]
    pub signal_expiry_minutes: i64,
    /// Entry price tolerance (bps). Default: 50.
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    /// Used when a signal carries no risk fraction. Default: 0.02.
    #[serde(default = "default_risk_fraction")]
    pub default_risk_fraction: Decimal,
    /// Used when a signal carries no leverage. Default: 5.
    #[serde(default = "default_leverage")]
    pub default_leverage: Decimal,
    #[serde(default = "default_sz_decimals")]
    pub default_sz_decimals: u32,
    /// Pause between the entry fill and the TP order (ms). Default: 2000.
    #[serde(default = "default_entry_settle_ms")]
    pub entry_settle_ms: u64,
    /// Repeat executions of one signal inside this window are blocked. Default: 60.
    #[serde(default = "default_duplicate_cooldown_secs")]
    pub duplicate_cooldown_secs: i64,
    /// Emergency close price tolerance. Default: 0.02 (2%).
    #[serde(default = "default_emergency_slippage_pct")]
    pub emergency_slippage_pct: Decimal,
    #[serde(default)]
    pub startup_delay_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_trading_batch_size() -> usize {
    25
}

fn default_trading_batch_delay_ms() -> u64 {
    50
}

fn default_signal_expiry_minutes() -> i64 {
    15
}

fn default_slippage_bps() -> u32 {
    50
}

fn default_risk_fraction() -> Decimal {
    Decimal::new(2, 2)
}

fn default_leverage() -> Decimal {
    Decimal::from(5)
}

fn default_sz_decimals() -> u32 {
    2
}

fn default_entry_settle_ms() -> u64 {
    2_000
}

fn default_duplicate_cooldown_secs() -> i64 {
    60
}

fn default_emergency_slippage_pct() -> Decimal {
    Decimal::new(2, 2)
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_trading_batch_size(),
            batch_delay_ms: default_trading_batch_delay_ms(),
            signal_expiry_minutes: default_signal_expiry_minutes(),
            slippage_bps: default_slippage_bps(),
            default_risk_fraction: default_risk_fraction(),
            default_leverage: default_leverage(),
            default_sz_decimals: default_sz_decimals(),
            entry_settle_ms: default_entry_settle_ms(),
            duplicate_cooldown_secs: default_duplicate_cooldown_secs(),
            emergency_slippage_pct: default_emergency_slippage_pct(),
            startup_delay_secs: 0,
        }
    }
}

impl TradingConfig {
    pub fn bracket_config(&self) -> BracketConfig {
        BracketConfig {
            slippage_bps: self.slippage_bps,
            default_risk_fraction: self.default_risk_fraction,
            default_leverage: self.default_leverage,
            default_sz_decimals: self.default_sz_decimals,
            entry_settle: Duration::from_millis(self.entry_settle_ms),
            duplicate_cooldown: chrono::Duration::seconds(self.duplicate_cooldown_secs),
            emergency_slippage: self.emergency_slippage_pct,
        }
    }

    pub fn loop_config(&self) -> TradingLoopConfig {
        TradingLoopConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            batch: BatchConfig::new(self.batch_size, Duration::from_millis(self.batch_delay_ms)),
            signal_window: chrono::Duration::minutes(self.signal_expiry_minutes),
            startup_delay: Duration::from_secs(self.startup_delay_secs),
            ..TradingLoopConfig::default()
        }
    }
}

/// Order placement retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Default: 1000.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Default: 8000.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

// ============================================================================
// Store and notifier
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Required for the postgres backend. `DATABASE_URL` overrides.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Default: 10.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierBackend {
    #[default]
    Log,
    Email,
}

/// Operator alert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub backend: NotifierBackend,
    #[serde(default = "default_email_api_url")]
    pub api_url: String,
    /// `RESEND_API_KEY` overrides.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sender address. `FROM_EMAIL` overrides.
    #[serde(default)]
    pub from: Option<String>,
    /// Operator address. `ADMIN_EMAIL` overrides.
    #[serde(default)]
    pub to: Option<String>,
}

fn default_email_api_url() -> String {
    "https://api.resend.com/emails".to_string()
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            backend: NotifierBackend::Log,
            api_url: default_email_api_url(),
            api_key: None,
            from: None,
            to: None,
        }
    }
}

impl NotifierConfig {
    /// Email settings; every field must be present.
    pub fn email_config(&self) -> AppResult<EmailConfig> {
        let missing = |field: &str| {
            AppError::Config(format!("notifier.{field} is required for the email backend"))
        };
        Ok(EmailConfig {
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone().ok_or_else(|| missing("api_key"))?,
            from: self.from.clone().ok_or_else(|| missing("from"))?,
            to: self.to.clone().ok_or_else(|| missing("to"))?,
        })
    }
}

// ============================================================================
// Paper trading
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting equity of every simulated account. Default: 10000.
    #[serde(default = "default_initial_equity")]
    pub initial_equity: Decimal,
    #[serde(default = "default_info_url")]
    pub info_url: String,
    /// Seconds between mid refreshes; 0 disables the refresher. Default: 5.
    #[serde(default = "default_mid_refresh_secs")]
    pub mid_refresh_secs: u64,
    /// Fixed starting mids, applied before the first refresh.
    #[serde(default)]
    pub mids: BTreeMap<String, Decimal>,
}

fn default_initial_equity() -> Decimal {
    Decimal::from(10_000)
}

fn default_info_url() -> String {
    DEFAULT_INFO_URL.to_string()
}

fn default_mid_refresh_secs() -> u64 {
    5
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_equity: default_initial_equity(),
            info_url: default_info_url(),
            mid_refresh_secs: default_mid_refresh_secs(),
            mids: BTreeMap::new(),
        }
    }
}

/// Subscriber row seeded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberSeed {
    pub id: i64,
    pub api_key: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
    /// Hex private key, stored as the subscriber's credential blob.
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub access_granted: bool,
}

fn default_true() -> bool {
    true
}

impl SubscriberSeed {
    pub fn to_subscriber(&self) -> Subscriber {
        let mut subscriber = Subscriber::new(SubscriberId(self.id), self.api_key.clone());
        subscriber.email = self.email.clone();
        subscriber.wallet_address = self.wallet_address.clone();
        subscriber.encrypted_credentials = self
            .credential
            .as_ref()
            .map(|key| key.trim().as_bytes().to_vec());
        subscriber.active = self.active;
        subscriber.access_granted = self.access_granted;
        subscriber
    }
}

// ============================================================================
// AppConfig
// ============================================================================

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: OperatingMode,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub subscribers: Vec<SubscriberSeed>,
}

impl AppConfig {
    /// Read the file, apply environment overrides and validate.
    pub fn load(path: &str) -> AppResult<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup` (environment variable name to value).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.store.database_url = Some(url);
        }
        if let Some(raw) = lookup("SLIPPAGE_BPS") {
            match raw.trim().parse::<u32>() {
                Ok(bps) => self.trading.slippage_bps = bps,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid SLIPPAGE_BPS"),
            }
        }
        if let Some(key) = lookup("RESEND_API_KEY") {
            self.notifier.api_key = Some(key);
        }
        if let Some(to) = lookup("ADMIN_EMAIL") {
            self.notifier.to = Some(to);
        }
        if let Some(from) = lookup("FROM_EMAIL") {
            self.notifier.from = Some(from);
        }
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let risk = self.trading.default_risk_fraction;
        if risk <= Decimal::ZERO || risk > Decimal::ONE {
            return Err(AppError::Config(format!(
                "trading.default_risk_fraction must be in (0, 1], got {risk}"
            )));
        }
        if self.trading.default_leverage < Decimal::ONE {
            return Err(AppError::Config(
                "trading.default_leverage must be at least 1".to_string(),
            ));
        }
        if self.trading.signal_expiry_minutes <= 0 {
            return Err(AppError::Config(
                "trading.signal_expiry_minutes must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(AppError::Config(
                "store.database_url (or DATABASE_URL) is required for the postgres backend"
                    .to_string(),
            ));
        }
        if self.notifier.backend == NotifierBackend::Email {
            self.notifier.email_config()?;
        }

        let mut ids = HashSet::new();
        for seed in &self.subscribers {
            if !ids.insert(seed.id) {
                return Err(AppError::Config(format!(
                    "subscriber id {} is seeded twice",
                    seed.id
                )));
            }
        }
        Ok(())
    }

    pub fn is_paper_mode(&self) -> bool {
        self.mode == OperatingMode::Paper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_position::ClassifierKind;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.is_paper_mode());
        assert_eq!(config.trading.poll_interval_secs, 10);
        assert_eq!(config.trading.default_risk_fraction, dec!(0.02));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.monitor.check_interval_secs, 60);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.notifier.backend, NotifierBackend::Log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            mode = "paper"

            [trading]
            poll_interval_secs = 5
            entry_settle_ms = 0

            [monitor]
            exit_classifier = "order_presence"

            [paper]
            mid_refresh_secs = 0
            mids = { ADA = "0.50" }

            [[subscribers]]
            id = 7
            api_key = "rk_live_seven"
            credential = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            "#,
        )
        .unwrap();

        assert_eq!(config.trading.poll_interval_secs, 5);
        assert_eq!(config.trading.batch_size, 25);
        assert_eq!(config.trading.bracket_config().entry_settle, Duration::ZERO);
        assert_eq!(config.monitor.exit_classifier, ClassifierKind::OrderPresence);
        assert_eq!(config.monitor.batch_size, 50);
        assert_eq!(config.paper.mids.get("ADA"), Some(&dec!(0.50)));

        let subscriber = config.subscribers[0].to_subscriber();
        assert_eq!(subscriber.id, SubscriberId(7));
        assert!(subscriber.active);
        assert!(subscriber.has_credentials());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://relay@localhost/relay"),
            ("SLIPPAGE_BPS", "75"),
            ("RESEND_API_KEY", "re_test"),
            ("ADMIN_EMAIL", "ops@example.com"),
            ("FROM_EMAIL", "relay@example.com"),
        ]);
        let mut config = AppConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| (*v).to_string()));

        assert_eq!(
            config.store.database_url.as_deref(),
            Some("postgres://relay@localhost/relay")
        );
        assert_eq!(config.trading.slippage_bps, 75);
        let email = config.notifier.email_config().unwrap();
        assert_eq!(email.api_key, "re_test");
        assert_eq!(email.to, "ops@example.com");
        assert_eq!(email.from, "relay@example.com");
    }

    #[test]
    fn test_invalid_slippage_override_is_ignored() {
        let mut config = AppConfig::default();
        config.apply_overrides(|name| (name == "SLIPPAGE_BPS").then(|| "lots".to_string()));
        assert_eq!(config.trading.slippage_bps, 50);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut postgres = AppConfig::default();
        postgres.store.backend = StoreBackend::Postgres;
        assert!(matches!(postgres.validate(), Err(AppError::Config(_))));

        let mut email = AppConfig::default();
        email.notifier.backend = NotifierBackend::Email;
        email.notifier.api_key = Some("re_test".to_string());
        assert!(email.validate().is_err());

        let mut risk = AppConfig::default();
        risk.trading.default_risk_fraction = dec!(1.5);
        assert!(risk.validate().is_err());

        let mut seeds = AppConfig::default();
        let seed = SubscriberSeed {
            id: 1,
            api_key: "rk_one".to_string(),
            email: None,
            wallet_address: None,
            credential: None,
            active: true,
            access_granted: true,
        };
        seeds.subscribers = vec![seed.clone(), seed];
        assert!(seeds.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = toml::to_string(&AppConfig::default()).unwrap();
        assert!(toml_str.contains("mode"));
        assert!(toml_str.contains("[trading]"));
        assert!(toml_str.contains("[monitor]"));
    }
}

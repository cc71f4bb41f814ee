use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::TimeInForce;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub execution: ExecutionConfig,
    pub budget: BudgetConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub fsm: FsmConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which transition table the engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStrategyKind {
    /// Timeouts retry with backoff
    Standard,
    /// Timeouts cancel the order and stop
    Legacy,
}

impl Default for TransitionStrategyKind {
    fn default() -> Self {
        Self::Standard
    }
}

/// When the price surplus of a committed fill goes back to available capital
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurplusReleasePolicy {
    /// In the same atomic step as the commit
    PerFill,
    /// Only when the reservation is settled
    OnTerminal,
}

impl Default for SurplusReleasePolicy {
    fn default() -> Self {
        Self::PerFill
    }
}

/// Baseline used when the capital watermark is rebased after a stale-state reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakRebasePolicy {
    SessionPeak,
    MaxOfSessionAndRolling,
}

impl Default for PeakRebasePolicy {
    fn default() -> Self {
        Self::SessionPeak
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum order attempts per intent
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Max distance of the limit price from the reference price (e.g. 0.005 = 0.5%)
    pub slippage_band: Decimal,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub transition_strategy: TransitionStrategyKind,
    /// Extra time allowed on top of the exchange-side wait before giving up locally
    #[serde(default = "default_wait_grace_ms")]
    pub wait_grace_ms: u64,
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_wait_grace_ms() -> u64 {
    1_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 400,
            max_backoff_ms: default_max_backoff_ms(),
            slippage_band: Decimal::new(5, 3),
            time_in_force: TimeInForce::GTC,
            transition_strategy: TransitionStrategyKind::Standard,
            wait_grace_ms: default_wait_grace_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Backoff delay after the given 0-based attempt: base * 2^attempt, capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Tradable capital available at startup
    pub initial_capital: Decimal,
    /// Extra notional held on top of qty * price to cover fees and slippage
    #[serde(default)]
    pub reserve_buffer: Decimal,
    /// Cap on notional still held per symbol by open reservations (None = no cap)
    #[serde(default)]
    pub max_symbol_notional: Option<Decimal>,
    #[serde(default)]
    pub surplus_release: SurplusReleasePolicy,
    #[serde(default)]
    pub peak_rebase: PeakRebasePolicy,
    /// Rolling equity peak carried over from previous sessions
    #[serde(default)]
    pub rolling_peak: Option<Decimal>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(1000),
            reserve_buffer: Decimal::new(1, 2),
            max_symbol_notional: None,
            surplus_release: SurplusReleasePolicy::PerFill,
            peak_rebase: PeakRebasePolicy::SessionPeak,
            rolling_peak: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// Must exceed the longest plausible order-to-notification delay
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

/// Upper bound on the idempotency horizon
pub const MAX_IDEMPOTENCY_EXPIRY_SECS: u64 = 365 * 24 * 3600;

fn default_expiry_secs() -> u64 {
    3600
}

fn default_max_entries() -> usize {
    100_000
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// How long a sent order may wait for a fill per attempt
    #[serde(default = "default_fill_timeout_ms")]
    pub fill_timeout_ms: u64,
    /// Quiet period after a terminal phase before the key accepts a new intent
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Upper bound on time spent in RESERVED, RETRY or ERROR
    #[serde(default = "default_max_order_lifetime_ms")]
    pub max_order_lifetime_ms: u64,
}

fn default_fill_timeout_ms() -> u64 {
    5_000
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_max_order_lifetime_ms() -> u64 {
    300_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fill_timeout_ms: default_fill_timeout_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_order_lifetime_ms: default_max_order_lifetime_ms(),
        }
    }
}

/// Storage backend for snapshots and the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    Memory,
    File,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_audit_path")]
    pub audit_path: PathBuf,
    /// Intent fingerprints (file backend only)
    #[serde(default = "default_fingerprint_path")]
    pub fingerprint_path: PathBuf,
    /// PostgreSQL connection URL (postgres backend only)
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("data/snapshots")
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("data/audit.jsonl")
}

fn default_fingerprint_path() -> PathBuf {
    PathBuf::from("data/intents.jsonl")
}

fn default_max_connections() -> u32 {
    5
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::File,
            snapshot_dir: default_snapshot_dir(),
            audit_path: default_audit_path(),
            fingerprint_path: default_fingerprint_path(),
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsmConfig {
    /// Transition records kept per state
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    32
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Start with new intents disabled
    #[serde(default)]
    pub kill_switch: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("execution.max_retries", 3)?
            .set_default("execution.base_backoff_ms", 400)?
            .set_default("execution.slippage_band", "0.005")?
            .set_default("budget.initial_capital", "1000")?
            .set_default("persistence.backend", "file")?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ORDEX_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ORDEX_EXECUTION__MAX_RETRIES, etc.)
            .add_source(
                Environment::with_prefix("ORDEX")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// In-memory configuration used by the CLI dry run and tests
    pub fn default_config() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            budget: BudgetConfig::default(),
            idempotency: IdempotencyConfig::default(),
            timeouts: TimeoutConfig::default(),
            persistence: PersistenceConfig {
                backend: PersistenceBackend::Memory,
                ..PersistenceConfig::default()
            },
            fsm: FsmConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.execution.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }

        if self.execution.base_backoff_ms > self.execution.max_backoff_ms {
            errors.push("execution.base_backoff_ms must not exceed max_backoff_ms".to_string());
        }

        if self.execution.slippage_band < Decimal::ZERO || self.execution.slippage_band >= Decimal::ONE {
            errors.push("execution.slippage_band must be in [0, 1)".to_string());
        }

        if self.budget.initial_capital < Decimal::ZERO {
            errors.push("budget.initial_capital must not be negative".to_string());
        }

        if self.budget.reserve_buffer < Decimal::ZERO {
            errors.push("budget.reserve_buffer must not be negative".to_string());
        }

        if let Some(cap) = self.budget.max_symbol_notional {
            if cap <= Decimal::ZERO {
                errors.push("budget.max_symbol_notional must be positive".to_string());
            }
        }

        // The idempotency horizon has to outlive a full order lifetime, otherwise a
        // late fill notification could be accepted as new.
        if self.idempotency.expiry_secs.saturating_mul(1000) < self.timeouts.max_order_lifetime_ms {
            errors.push(
                "idempotency.expiry_secs must cover timeouts.max_order_lifetime_ms".to_string(),
            );
        }

        if self.idempotency.expiry_secs > MAX_IDEMPOTENCY_EXPIRY_SECS {
            errors.push("idempotency.expiry_secs must not exceed one year".to_string());
        }

        if self.idempotency.max_entries == 0 {
            errors.push("idempotency.max_entries must be positive".to_string());
        }

        if self.timeouts.fill_timeout_ms == 0 {
            errors.push("timeouts.fill_timeout_ms must be positive".to_string());
        }

        if self.persistence.backend == PersistenceBackend::Postgres
            && self.persistence.database_url.is_none()
        {
            errors.push("persistence.database_url is required for the postgres backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_backoff_schedule() {
        let exec = ExecutionConfig {
            base_backoff_ms: 400,
            max_backoff_ms: 10_000,
            ..ExecutionConfig::default()
        };
        assert_eq!(exec.backoff_for(0), Duration::from_millis(400));
        assert_eq!(exec.backoff_for(1), Duration::from_millis(800));
        assert_eq!(exec.backoff_for(2), Duration::from_millis(1600));
        // Capped
        assert_eq!(exec.backoff_for(10), Duration::from_millis(10_000));
        assert_eq!(exec.backoff_for(200), Duration::from_millis(10_000));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default_config().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut cfg = AppConfig::default_config();
        cfg.execution.max_retries = 0;
        cfg.execution.slippage_band = dec!(1.5);
        cfg.idempotency.expiry_secs = 1;
        cfg.persistence.backend = PersistenceBackend::Postgres;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_huge_expiry_is_rejected_without_overflow() {
        let mut cfg = AppConfig::default_config();
        cfg.idempotency.expiry_secs = u64::MAX;
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors, vec!["idempotency.expiry_secs must not exceed one year".to_string()]);
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let cfg = AppConfig::load_from("does-not-exist").unwrap();
        assert_eq!(cfg.execution.max_retries, 3);
        assert_eq!(cfg.execution.base_backoff_ms, 400);
        assert_eq!(cfg.budget.initial_capital, dec!(1000));
        assert_eq!(cfg.idempotency.expiry_secs, 3600);
        assert_eq!(cfg.persistence.backend, PersistenceBackend::File);
    }

    #[test]
    fn test_shipped_default_toml() {
        let cfg = AppConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config")).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.budget.reserve_buffer, dec!(0.01));
        assert_eq!(cfg.execution.transition_strategy, TransitionStrategyKind::Standard);
        assert_eq!(cfg.budget.surplus_release, SurplusReleasePolicy::PerFill);
        assert_eq!(cfg.timeouts.fill_timeout_ms, 5_000);
    }
}

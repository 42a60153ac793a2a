use crate::error::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// The root configuration structure for the entire application.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub admission: AdmissionSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub exchanges: ExchangesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            admission: AdmissionSettings::default(),
            execution: ExecutionSettings::default(),
            lifecycle: LifecycleSettings::default(),
            tiers: default_tiers(),
            database: DatabaseConfig::default(),
            exchanges: ExchangesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::ValidationError("at least one tier must be configured".into()));
        }
        let mut names = HashSet::new();
        let mut priorities = HashSet::new();
        for tier in &self.tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(ConfigError::ValidationError(format!("duplicate tier name '{}'", tier.name)));
            }
            if !priorities.insert(tier.priority) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tier priority {} ('{}')",
                    tier.priority, tier.name
                )));
            }
            if tier.commission_rate < Decimal::ZERO || tier.commission_rate >= Decimal::ONE {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}': commission_rate must be within [0, 1)",
                    tier.name
                )));
            }
            if tier.max_stop_loss_pct <= Decimal::ZERO || tier.max_stop_loss_pct > Decimal::ONE {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}': max_stop_loss_pct must be within (0, 1]",
                    tier.name
                )));
            }
            if tier.max_leverage == 0 || tier.max_open_positions == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}': max_leverage and max_open_positions must be positive",
                    tier.name
                )));
            }
        }
        if self.engine.min_confidence < Decimal::ZERO || self.engine.min_confidence > dec!(100) {
            return Err(ConfigError::ValidationError("engine.min_confidence must be within 0..=100".into()));
        }
        if self.engine.max_concurrent_users_per_tier == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_concurrent_users_per_tier must be positive".into(),
            ));
        }
        if self.execution.min_partial_fill_pct <= Decimal::ZERO || self.execution.min_partial_fill_pct > Decimal::ONE {
            return Err(ConfigError::ValidationError(
                "execution.min_partial_fill_pct must be within (0, 1]".into(),
            ));
        }
        if self.execution.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError("execution.retry.max_attempts must be positive".into()));
        }
        if self.lifecycle.price_move_threshold_pct < Decimal::ZERO {
            return Err(ConfigError::ValidationError(
                "lifecycle.price_move_threshold_pct cannot be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// The tier users with an unknown tier name fall back to: the lowest priority one.
    pub fn fallback_tier(&self) -> Option<&TierConfig> {
        self.tiers.iter().max_by_key(|t| t.priority)
    }

    /// Resolves a tier by name, falling back to the lowest priority tier.
    pub fn tier_or_fallback(&self, name: &str) -> Option<&TierConfig> {
        self.tier(name).or_else(|| self.fallback_tier())
    }
}

/// Settings for the signal pipeline as a whole.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Signals older than this are abandoned.
    pub signal_validity_secs: u64,
    /// Decisions with a lower confidence (0-100) are treated as HOLD.
    pub min_confidence: Decimal,
    /// Bounded fan-out within one tier.
    pub max_concurrent_users_per_tier: usize,
    /// Route every order to the paper exchange instead of the user's venues.
    pub dry_run: bool,
    /// Quote currencies recognised when splitting symbols, longest first.
    pub quote_currencies: Vec<String>,
    /// Upper bound on a decision oracle call.
    pub oracle_timeout_ms: u64,
    /// Endpoint of the external decision oracle. Without one, signals are followed as-is.
    pub oracle_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            signal_validity_secs: 30,
            min_confidence: dec!(50),
            max_concurrent_users_per_tier: 16,
            dry_run: false,
            quote_currencies: vec!["USDT".into(), "USDC".into(), "BUSD".into(), "USD".into()],
            oracle_timeout_ms: 15_000,
            oracle_url: None,
        }
    }
}

impl EngineSettings {
    pub fn signal_validity(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.signal_validity_secs as i64)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}

/// Global admission control parameters. Tier limits live on `TierConfig`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionSettings {
    /// Smallest position notional worth opening, in quote currency.
    pub min_notional: Decimal,
    /// Rule violations tolerated before a user is suspended.
    pub warning_threshold: u32,
    /// Cooldown applied when a decision does not carry one.
    pub default_cooldown_minutes: u32,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            min_notional: dec!(10),
            warning_threshold: 5,
            default_cooldown_minutes: 120,
        }
    }
}

/// Order placement and fill verification parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub fill_timeout_ms: u64,
    pub fill_poll_interval_ms: u64,
    /// A leg whose fill stays below this fraction when the timeout expires fails.
    pub min_partial_fill_pct: Decimal,
    /// Upper bound on any single exchange call.
    pub exchange_call_timeout_ms: u64,
    pub instrument_cache_ttl_secs: u64,
    pub retry: RetrySettings,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            fill_timeout_ms: 10_000,
            fill_poll_interval_ms: 500,
            min_partial_fill_pct: dec!(0.5),
            exchange_call_timeout_ms: 5_000,
            instrument_cache_ttl_secs: 3_600,
            retry: RetrySettings::default(),
        }
    }
}

impl ExecutionSettings {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }

    pub fn exchange_call_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_call_timeout_ms)
    }

    pub fn instrument_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.instrument_cache_ttl_secs)
    }
}

/// Bounded retry with exponential backoff for idempotent exchange reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

/// Position monitoring parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub monitor_interval_secs: u64,
    /// Minimum relative move before a re-priced position is written back.
    pub price_move_threshold_pct: Decimal,
    /// Positions held longer than this are closed.
    pub max_hold_minutes: u64,
    pub max_concurrent_checks: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 30,
            price_move_threshold_pct: dec!(0.005),
            max_hold_minutes: 60,
            max_concurrent_checks: 8,
        }
    }
}

impl LifecycleSettings {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn max_hold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_hold_minutes as i64)
    }
}

/// A subscription class: execution priority, delay, commission and risk limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// Lower runs first.
    pub priority: u32,
    /// Wait before this tier starts executing.
    pub delay_ms: u64,
    /// Fraction of profit retained as commission.
    pub commission_rate: Decimal,
    pub max_open_positions: usize,
    pub max_position_notional: Decimal,
    pub max_daily_volume: Decimal,
    pub max_leverage: u8,
    pub max_stop_loss_pct: Decimal,
    pub min_balance: Decimal,
}

impl TierConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "premium".into(),
            priority: 1,
            delay_ms: 0,
            commission_rate: dec!(0.10),
            max_open_positions: 3,
            max_position_notional: dec!(50000),
            max_daily_volume: dec!(250000),
            max_leverage: 20,
            max_stop_loss_pct: dec!(0.10),
            min_balance: dec!(10),
        },
        TierConfig {
            name: "standard".into(),
            priority: 2,
            delay_ms: 1_000,
            commission_rate: dec!(0.15),
            max_open_positions: 3,
            max_position_notional: dec!(10000),
            max_daily_volume: dec!(50000),
            max_leverage: 10,
            max_stop_loss_pct: dec!(0.05),
            min_balance: dec!(10),
        },
        TierConfig {
            name: "trial".into(),
            priority: 3,
            delay_ms: 3_000,
            commission_rate: dec!(0.20),
            max_open_positions: 2,
            max_position_notional: dec!(1000),
            max_daily_volume: dec!(5000),
            max_leverage: 5,
            max_stop_loss_pct: dec!(0.03),
            min_balance: dec!(10),
        },
    ]
}

/// Connection settings for the persistent store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Falls back to the `DATABASE_URL` environment variable.
    pub primary_url: Option<String>,
    pub replica_urls: Vec<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub statement_timeout_ms: u64,
    pub health_check_interval_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            primary_url: None,
            replica_urls: Vec::new(),
            max_connections: 10,
            acquire_timeout_secs: 5,
            statement_timeout_ms: 5_000,
            health_check_interval_secs: 15,
        }
    }
}

/// REST endpoints and simulation parameters per venue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangesConfig {
    pub binance: VenueConfig,
    pub bybit: VenueConfig,
    pub paper: PaperConfig,
    pub recv_window_ms: u64,
}

impl Default for ExchangesConfig {
    fn default() -> Self {
        Self {
            binance: VenueConfig {
                base_url: "https://fapi.binance.com".into(),
                testnet_url: "https://testnet.binancefuture.com".into(),
            },
            bybit: VenueConfig {
                base_url: "https://api.bybit.com".into(),
                testnet_url: "https://api-testnet.bybit.com".into(),
            },
            paper: PaperConfig::default(),
            recv_window_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VenueConfig {
    pub base_url: String,
    pub testnet_url: String,
}

impl VenueConfig {
    pub fn url(&self, testnet: bool) -> &str {
        if testnet { &self.testnet_url } else { &self.base_url }
    }
}

/// The simulated venue used for dry runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    /// Balance each simulated account starts with, per quote currency.
    pub starting_balance: Decimal,
    /// Adverse price move applied to every simulated fill.
    pub slippage_pct: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub qty_step: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_balance: dec!(10000),
            slippage_pct: dec!(0.0005),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
            qty_step: dec!(0.001),
        }
    }
}

/// Where and how log lines are written.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive. `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    /// Enables a daily rolling log file in this directory.
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            directory: None,
            file_prefix: "relay.log".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.signal_validity_secs, 30);
        assert_eq!(config.admission.min_notional, dec!(10));
        assert_eq!(config.execution.fill_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn duplicate_tier_priority_is_rejected() {
        let mut config = Config::default();
        config.tiers[1].priority = config.tiers[0].priority;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn unknown_tier_falls_back_to_lowest_priority() {
        let config = Config::default();
        assert_eq!(config.tier_or_fallback("vip").unwrap().name, "trial");
        assert_eq!(config.tier_or_fallback("premium").unwrap().name, "premium");
    }
}

//! Configuration management with validation and defaults
//!
//! `EngineConfig` is loaded from TOML, overridden from `TAIXIU_*` environment
//! variables and validated before any component is built from it.

use crate::errors::{ConfigurationError, EngineResult};
use crate::types::Amount;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Basis-point denominator used by all rate settings
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub game: GameConfig,
    pub bonus: BonusConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
}

/// Round timing and payout rules
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub round_seconds: u64,
    pub min_bet: Amount,
    /// Winner payout as a multiple of stake, in basis points (19_700 = x1.97)
    pub win_multiplier_bps: u64,
    /// House share of each winning stake, in basis points (300 = 3%)
    pub house_rate_bps: u64,
    pub house_share_mode: HouseShareMode,
    /// Rounds of history retained per room
    pub max_history: usize,
    /// Upper bound on rolls when a forcing mode demands a side
    pub resolver_max_attempts: u32,
    /// Seconds-remaining marks at which a countdown is announced
    pub countdown_milestones: Vec<u64>,
    /// Betting closes this many seconds before the round boundary
    pub lock_seconds: u64,
    pub settlement_retry_limit: u32,
    pub settlement_retry_backoff_ms: u64,
    pub orphan_policy: OrphanPolicy,
    /// Fixed seed for reproducible dice; entropy when unset
    pub rng_seed: Option<u64>,
    pub announcement_queue: usize,
}

/// How the house share of a winning stake is booked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseShareMode {
    /// Full payout credited; house share added to the jackpot on top
    Separate,
    /// House share deducted from the payout before crediting, then added to the jackpot
    Deducted,
}

/// What startup reconciliation does with bets left on past rounds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    Refund,
    Settle,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            round_seconds: 60,
            min_bet: 1_000,
            win_multiplier_bps: 19_700,
            house_rate_bps: 300,
            house_share_mode: HouseShareMode::Separate,
            max_history: 20,
            resolver_max_attempts: 200,
            countdown_milestones: vec![30, 10, 5],
            lock_seconds: 5,
            settlement_retry_limit: 5,
            settlement_retry_backoff_ms: 200,
            orphan_policy: OrphanPolicy::Refund,
            rng_seed: None,
            announcement_queue: 1024,
        }
    }
}

/// Start bonus and withdrawal rules
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusConfig {
    pub start_bonus: Amount,
    /// Distinct rounds to wager in before a bonus holder may withdraw
    pub required_rounds: u32,
    pub daily_withdrawal_limit: Amount,
    pub promo_default_rounds: u32,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            start_bonus: 80_000,
            required_rounds: 8,
            daily_withdrawal_limit: 1_000_000,
            promo_default_rounds: 8,
        }
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::RocksDb,
            data_directory: "./DB/taixiu_data".to_string(),
            write_buffer_size_mb: 64,
            clear_on_start: false,
        }
    }
}

/// Monitoring and logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub metrics_interval_seconds: u64,
    pub log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_interval_seconds: 60,
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    /// Local runs: in-memory ledger, verbose logs
    pub fn development() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_level: LogLevel::Debug,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Persistent deployment
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::RocksDb,
                data_directory: "./DB/taixiu_data".to_string(),
                write_buffer_size_mb: 128,
                clear_on_start: false, // Production: preserve balances
            },
            ..Default::default()
        }
    }

    /// Deterministic dice and short rounds for tests
    pub fn testing() -> Self {
        Self {
            game: GameConfig {
                round_seconds: 60,
                rng_seed: Some(7),
                settlement_retry_backoff_ms: 1,
                ..Default::default()
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                clear_on_start: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let game = &self.game;
        if game.round_seconds == 0 {
            return Err(invalid("game.round_seconds", game.round_seconds, "must be > 0"));
        }
        if game.lock_seconds == 0 || game.lock_seconds >= game.round_seconds {
            return Err(invalid(
                "game.lock_seconds",
                game.lock_seconds,
                "must be at least 1 and shorter than the round",
            ));
        }
        if game.min_bet == 0 {
            return Err(invalid("game.min_bet", game.min_bet, "must be > 0"));
        }
        if game.win_multiplier_bps < BPS_DENOMINATOR {
            return Err(invalid(
                "game.win_multiplier_bps",
                game.win_multiplier_bps,
                "a winner must get at least the stake back",
            ));
        }
        if game.house_share_mode == HouseShareMode::Deducted
            && game.win_multiplier_bps < BPS_DENOMINATOR + game.house_rate_bps
        {
            return Err(ConfigurationError::ValidationFailed(
                "deducted house share would pay winners less than their stake".to_string(),
            ));
        }
        if game.max_history == 0 {
            return Err(invalid("game.max_history", game.max_history, "must be > 0"));
        }
        if game.resolver_max_attempts == 0 {
            return Err(invalid(
                "game.resolver_max_attempts",
                game.resolver_max_attempts,
                "must be > 0",
            ));
        }
        if game.settlement_retry_limit == 0 {
            return Err(invalid(
                "game.settlement_retry_limit",
                game.settlement_retry_limit,
                "must be > 0",
            ));
        }
        if game.announcement_queue == 0 {
            return Err(invalid("game.announcement_queue", 0, "must be > 0"));
        }
        if self.storage.backend == StorageBackend::RocksDb && self.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired(
                "storage.data_directory".to_string(),
            ));
        }
        Ok(())
    }

    pub fn round_duration(&self) -> Duration {
        Duration::from_secs(self.game.round_seconds)
    }

    pub fn settlement_backoff(&self) -> Duration {
        Duration::from_millis(self.game.settlement_retry_backoff_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.metrics_interval_seconds)
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration loader with environment variable support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> EngineResult<EngineConfig> {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => EngineConfig::default(),
        };

        apply_env_overrides(&mut config, |name| env::var(name).ok())?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(path: &str) -> EngineResult<EngineConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        parse_toml(&content)
    }

    /// Save configuration to file
    pub fn save(config: &EngineConfig, path: &str) -> EngineResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into()
        })
    }
}

pub fn parse_toml(content: &str) -> EngineResult<EngineConfig> {
    toml::from_str(content)
        .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
}

/// Apply `TAIXIU_*` overrides read through `lookup`
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<(), ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(name: &str, raw: String) -> Result<T, ConfigurationError> {
        raw.parse().map_err(|_| ConfigurationError::InvalidValue {
            field: name.to_string(),
            value: raw,
            reason: "not a valid number".to_string(),
        })
    }

    if let Some(v) = lookup("TAIXIU_ROUND_SECONDS") {
        config.game.round_seconds = parsed("TAIXIU_ROUND_SECONDS", v)?;
    }
    if let Some(v) = lookup("TAIXIU_MIN_BET") {
        config.game.min_bet = parsed("TAIXIU_MIN_BET", v)?;
    }
    if let Some(v) = lookup("TAIXIU_WIN_MULTIPLIER_BPS") {
        config.game.win_multiplier_bps = parsed("TAIXIU_WIN_MULTIPLIER_BPS", v)?;
    }
    if let Some(v) = lookup("TAIXIU_HOUSE_RATE_BPS") {
        config.game.house_rate_bps = parsed("TAIXIU_HOUSE_RATE_BPS", v)?;
    }
    if let Some(v) = lookup("TAIXIU_DATA_DIR") {
        config.storage.data_directory = v;
    }
    if let Some(v) = lookup("TAIXIU_LOG_LEVEL") {
        config.monitoring.log_level = match v.to_ascii_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => {
                return Err(ConfigurationError::InvalidValue {
                    field: "TAIXIU_LOG_LEVEL".to_string(),
                    value: v,
                    reason: "expected error|warn|info|debug|trace".to_string(),
                })
            }
        };
    }
    Ok(())
}

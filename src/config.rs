use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Monthly allotment granted to a tier on each reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierQuota {
    pub monthly_tokens: u64,
    pub monthly_free_actions: u64,
}

/// Sliding-window, session and abuse limits enforced before any spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: usize,
    pub requests_per_hour: usize,
    pub ingest_per_hour: usize,
    /// Minimum spacing between two ingest-class requests of one user.
    pub ingest_cooldown_secs: u64,
    pub session_duration_secs: u64,
    pub session_request_cap: u64,
    /// Requests per hour for one resource (all users) before it is flagged.
    pub resource_hourly_threshold: usize,
    /// Windows untouched for this long are evicted from the process cache.
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_minute: 10,
            requests_per_hour: 100,
            ingest_per_hour: 20,
            ingest_cooldown_secs: 30,
            session_duration_secs: 3600,
            session_request_cap: 200,
            resource_hourly_threshold: 50,
            idle_ttl_secs: 2 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_secs: u64,
    /// Upper bound on retained hashes per user.
    pub max_records_per_user: usize,
    pub idle_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            window_secs: 10,
            max_records_per_user: 100,
            idle_ttl_secs: 600,
        }
    }
}

/// Product policy for the default cost calculator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Flashcards/questions covered by one token on a full generation.
    pub items_per_token: u64,
    /// Tokens charged for a full set on regeneration.
    pub regenerate_set_cost: u64,
    /// Reference set size the regenerate ratio is taken against.
    pub regenerate_set_size: u64,
    pub reorganize_cost: u64,
    /// Minutes of video covered by one token on import.
    pub video_minutes_per_token: u64,
}

impl Default for CostConfig {
    fn default() -> Self {
        CostConfig {
            items_per_token: 5,
            regenerate_set_cost: 2,
            regenerate_set_size: 20,
            reorganize_cost: 1,
            video_minutes_per_token: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Users examined per reconciliation batch.
    pub batch_size: usize,
    /// Most recent entries attached to a drift result.
    pub implicated_entries: usize,
    /// Days a persisted reconciliation result is retained for audit.
    pub retention_days: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            batch_size: 100,
            implicated_entries: 20,
            retention_days: 90,
        }
    }
}

/// Configuration for the token ledger service and CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path (default: `.token-ledger/` in current directory)
    pub data_dir: PathBuf,

    /// Output format: "human" (default) or "json"
    pub output_format: String,

    /// Log level: "info", "debug", "warn", "error" (default: "info")
    pub log_level: String,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Tokens granted once when an account is created
    pub welcome_bonus: u64,

    /// Tier assigned to new accounts
    pub default_tier: String,

    pub tiers: BTreeMap<String, TierQuota>,

    /// Purchasable product id -> tokens credited
    pub products: BTreeMap<String, u64>,

    /// Attempts per optimistic transaction before surfacing `Internal`
    pub max_commit_attempts: u32,

    /// Offset of the reference timezone for monthly and daily boundaries
    pub reset_utc_offset_minutes: i32,

    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub cost: CostConfig,
    pub reconcile: ReconcileConfig,
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        let data_dir = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".token-ledger");

        let mut tiers = BTreeMap::new();
        tiers.insert(
            "free".to_string(),
            TierQuota {
                monthly_tokens: 50,
                monthly_free_actions: 5,
            },
        );
        tiers.insert(
            "premium".to_string(),
            TierQuota {
                monthly_tokens: 1000,
                monthly_free_actions: 20,
            },
        );

        let mut products = BTreeMap::new();
        products.insert("tokens_100".to_string(), 100);
        products.insert("tokens_500".to_string(), 500);
        products.insert("tokens_1200".to_string(), 1200);

        Config {
            data_dir,
            output_format: "human".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            welcome_bonus: 20,
            default_tier: "free".to_string(),
            tiers,
            products,
            max_commit_attempts: 5,
            reset_utc_offset_minutes: 0,
            rate_limit: RateLimitConfig::default(),
            dedup: DedupConfig::default(),
            cost: CostConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }

    /// Create config with custom data directory
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Config {
            data_dir,
            ..Config::new()
        }
    }

    /// Parse a TOML config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| Error::InvalidArgument(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the ledger misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.max_commit_attempts == 0 {
            return Err(Error::InvalidArgument(
                "max_commit_attempts must be at least 1".to_string(),
            ));
        }
        if !self.tiers.contains_key(&self.default_tier) {
            return Err(Error::InvalidArgument(format!(
                "default_tier {} has no quota",
                self.default_tier
            )));
        }
        if self.reset_utc_offset_minutes.abs() >= 24 * 60 {
            return Err(Error::InvalidArgument(
                "reset_utc_offset_minutes must be within one day".to_string(),
            ));
        }
        if self.cost.items_per_token == 0
            || self.cost.regenerate_set_size == 0
            || self.cost.video_minutes_per_token == 0
        {
            return Err(Error::InvalidArgument(
                "cost divisors must be greater than zero".to_string(),
            ));
        }
        if self
            .cost
            .regenerate_set_cost
            .checked_mul(crate::cost::MAX_QUANTITY)
            .is_none()
        {
            return Err(Error::InvalidArgument(
                "regenerate_set_cost is too large".to_string(),
            ));
        }
        if let Some((id, _)) = self.products.iter().find(|(_, tokens)| **tokens == 0) {
            return Err(Error::InvalidArgument(format!(
                "product {} credits zero tokens",
                id
            )));
        }
        Ok(())
    }

    /// Quota for a tier, falling back to the default tier.
    pub fn tier_quota(&self, tier: &str) -> Option<TierQuota> {
        self.tiers
            .get(tier)
            .or_else(|| self.tiers.get(&self.default_tier))
            .copied()
    }

    /// Get the data directory path
    pub fn get_data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Set data directory
    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    /// Get output format
    pub fn get_output_format(&self) -> &str {
        &self.output_format
    }

    /// Set output format ("human" or "json")
    pub fn set_output_format(&mut self, format: String) {
        self.output_format = format;
    }

    /// Get log level
    pub fn get_log_level(&self) -> &str {
        &self.log_level
    }

    /// Set log level
    pub fn set_log_level(&mut self, level: String) {
        self.log_level = level;
    }

    /// Get the directory holding per-user account documents
    pub fn get_accounts_dir(&self) -> PathBuf {
        self.data_dir.join("accounts")
    }

    /// Get the directory holding per-user ledger logs
    pub fn get_ledger_dir(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    /// Get reconciliation audit log path
    pub fn get_reconciliation_log_path(&self) -> PathBuf {
        self.data_dir.join("reconciliation.log")
    }

    /// Load config from environment variables
    ///
    /// Environment variables:
    /// - `TOKEN_LEDGER_CONFIG`: TOML file loaded before the overrides below
    /// - `TOKEN_LEDGER_DATA_DIR`: override data directory
    /// - `TOKEN_LEDGER_OUTPUT_FORMAT`: "human" or "json"
    /// - `TOKEN_LEDGER_LOG_LEVEL`: log level
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("TOKEN_LEDGER_CONFIG") {
            Ok(path) => Config::load(Path::new(&path))?,
            Err(_) => Config::new(),
        };

        if let Ok(dir) = env::var("TOKEN_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(format) = env::var("TOKEN_LEDGER_OUTPUT_FORMAT") {
            config.output_format = format;
        }

        if let Ok(level) = env::var("TOKEN_LEDGER_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

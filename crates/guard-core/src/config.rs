//! Configuration for the trading guard.
//!
//! Loaded from a TOML file, then overridden from the environment (secrets,
//! collaborator URLs) and finally from CLI flags.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use guard_common::{ClickHouseConfig, Platform};
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Top-level configuration for the guard service.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Logging level.
    pub log_level: String,

    /// Operator key for admin-only operations (clearing a kill switch).
    /// Always taken from `GUARD_ADMIN_KEY`; admin routes are disabled without it.
    pub admin_key: Option<String>,

    pub server: ServerConfig,
    pub confirmation: ConfirmationConfig,
    pub broadcast: BroadcastConfig,
    pub providers: ProviderConfig,
    pub execution: ExecutionConfig,

    /// Event journal.
    pub clickhouse: ClickHouseConfig,
}

/// REST and push listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub api_port: u16,
    pub push_port: u16,
    /// Maximum concurrent push connections.
    pub max_clients: usize,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            api_port: 3000,
            push_port: 3001,
            max_clients: 100,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    /// How long a go-live token stays redeemable.
    pub ttl: Duration,
    /// How long dead tokens are remembered before purge.
    pub purge_grace: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            purge_grace: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Events kept per user for replay.
    pub retention: usize,
    /// Per-observer queue bound.
    pub observer_queue_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Consecutive unacknowledged heartbeats before an observer is released.
    pub max_missed_heartbeats: u32,
    /// Queue bound for the journal and execution taps.
    pub tap_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            retention: 1024,
            observer_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            max_missed_heartbeats: 2,
            tap_capacity: 4096,
        }
    }
}

/// External collaborator settings.
///
/// A collaborator without a URL falls back to its in-process implementation.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Per-account balance lookup timeout.
    pub balance_timeout: Duration,
    /// Concurrent balance lookups per summary.
    pub max_concurrency: usize,
    /// Attempts for idempotent reads, including the first.
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    /// How long a validated session is remembered for the emergency stop
    /// when the identity service is unreachable.
    pub session_cache_ttl: Duration,
    pub identity_url: Option<String>,
    pub vault_url: Option<String>,
    pub polymarket_balance_url: Option<String>,
    pub kalshi_balance_url: Option<String>,
    pub execution_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            balance_timeout: Duration::from_secs(3),
            max_concurrency: 8,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            session_cache_ttl: Duration::from_secs(900),
            identity_url: None,
            vault_url: None,
            polymarket_balance_url: None,
            kalshi_balance_url: None,
            execution_url: None,
        }
    }
}

impl ProviderConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_base_delay)
    }

    pub fn balance_url(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Polymarket => self.polymarket_balance_url.as_deref(),
            Platform::Kalshi => self.kalshi_balance_url.as_deref(),
        }
    }
}

/// Delivery of mode changes to the execution engine.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Give up on a delivery after this long.
    pub delivery_ttl: Duration,
    pub retry_interval: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            delivery_ttl: Duration::from_secs(300),
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            admin_key: None,
            server: ServerConfig::default(),
            confirmation: ConfirmationConfig::default(),
            broadcast: BroadcastConfig::default(),
            providers: ProviderConfig::default(),
            execution: ExecutionConfig::default(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides for secrets and endpoints.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("GUARD_ADMIN_KEY") {
            self.admin_key = Some(key);
        }

        // ClickHouse credentials
        if let Ok(url) = std::env::var("CLICKHOUSE_URL") {
            self.clickhouse.url = url;
            self.clickhouse.enabled = true;
        }
        if let Ok(user) = std::env::var("CLICKHOUSE_USER") {
            self.clickhouse.user = Some(user);
        }
        if let Ok(pass) = std::env::var("CLICKHOUSE_PASSWORD") {
            self.clickhouse.password = Some(pass);
        }

        // Collaborator endpoints
        let endpoints = [
            ("GUARD_IDENTITY_URL", &mut self.providers.identity_url),
            ("GUARD_VAULT_URL", &mut self.providers.vault_url),
            ("GUARD_POLYMARKET_BALANCE_URL", &mut self.providers.polymarket_balance_url),
            ("GUARD_KALSHI_BALANCE_URL", &mut self.providers.kalshi_balance_url),
            ("GUARD_EXECUTION_URL", &mut self.providers.execution_url),
        ];
        for (var, slot) in endpoints {
            if let Ok(url) = std::env::var(var) {
                *slot = Some(url);
            }
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        api_port: Option<u16>,
        push_port: Option<u16>,
        log_level: Option<String>,
        clickhouse_url: Option<String>,
    ) {
        if let Some(port) = api_port {
            self.server.api_port = port;
        }
        if let Some(port) = push_port {
            self.server.push_port = port;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
        if let Some(url) = clickhouse_url {
            self.clickhouse.url = url;
            self.clickhouse.enabled = true;
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.server.api_port == self.server.push_port {
            bail!("api_port and push_port must differ");
        }
        if self.server.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }

        if self.confirmation.ttl.is_zero() {
            bail!("confirmation ttl_secs must be positive");
        }

        if self.broadcast.retention == 0 {
            bail!("broadcast retention must be at least 1");
        }
        if self.broadcast.observer_queue_capacity == 0 {
            bail!("observer_queue_capacity must be at least 1");
        }
        if self.broadcast.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval_ms must be positive");
        }
        if self.broadcast.max_missed_heartbeats == 0 {
            bail!("max_missed_heartbeats must be at least 1");
        }
        if self.broadcast.tap_capacity == 0 {
            bail!("tap_capacity must be at least 1");
        }

        if self.providers.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.providers.retry_attempts == 0 {
            bail!("retry_attempts must be at least 1");
        }
        if self.providers.balance_timeout.is_zero() {
            bail!("balance_timeout_ms must be positive");
        }

        if self.execution.delivery_ttl < self.execution.retry_interval {
            bail!("delivery_ttl_secs must cover at least one retry_interval_ms");
        }

        if let Some(key) = &self.admin_key {
            if key.len() < 16 {
                bail!("GUARD_ADMIN_KEY must be at least 16 characters");
            }
        }

        if self.clickhouse.enabled && self.clickhouse.batch_size == 0 {
            bail!("clickhouse batch_size must be at least 1");
        }

        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    server: ServerToml,
    #[serde(default)]
    confirmation: ConfirmationToml,
    #[serde(default)]
    broadcast: BroadcastToml,
    #[serde(default)]
    providers: ProvidersToml,
    #[serde(default)]
    execution: ExecutionToml,
    #[serde(default)]
    clickhouse: ClickHouseToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ServerToml {
    host: String,
    api_port: u16,
    push_port: u16,
    max_clients: usize,
    enable_cors: bool,
}

impl Default for ServerToml {
    fn default() -> Self {
        let d = ServerConfig::default();
        Self {
            host: d.host,
            api_port: d.api_port,
            push_port: d.push_port,
            max_clients: d.max_clients,
            enable_cors: d.enable_cors,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConfirmationToml {
    ttl_secs: u64,
    purge_grace_secs: u64,
}

impl Default for ConfirmationToml {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            purge_grace_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BroadcastToml {
    retention: usize,
    observer_queue_capacity: usize,
    heartbeat_interval_ms: u64,
    max_missed_heartbeats: u32,
    tap_capacity: usize,
}

impl Default for BroadcastToml {
    fn default() -> Self {
        Self {
            retention: 1024,
            observer_queue_capacity: 256,
            heartbeat_interval_ms: 15_000,
            max_missed_heartbeats: 2,
            tap_capacity: 4096,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BalanceUrlsToml {
    polymarket: Option<String>,
    kalshi: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ProvidersToml {
    balance_timeout_ms: u64,
    max_concurrency: usize,
    retry_attempts: u32,
    retry_base_delay_ms: u64,
    session_cache_ttl_secs: u64,
    identity_url: Option<String>,
    vault_url: Option<String>,
    execution_url: Option<String>,
    balance_urls: BalanceUrlsToml,
}

impl Default for ProvidersToml {
    fn default() -> Self {
        Self {
            balance_timeout_ms: 3_000,
            max_concurrency: 8,
            retry_attempts: 3,
            retry_base_delay_ms: 100,
            session_cache_ttl_secs: 900,
            identity_url: None,
            vault_url: None,
            execution_url: None,
            balance_urls: BalanceUrlsToml::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ExecutionToml {
    delivery_ttl_secs: u64,
    retry_interval_ms: u64,
}

impl Default for ExecutionToml {
    fn default() -> Self {
        Self {
            delivery_ttl_secs: 300,
            retry_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ClickHouseToml {
    enabled: bool,
    url: String,
    database: String,
    batch_size: usize,
    flush_period_secs: u64,
}

impl Default for ClickHouseToml {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8123".to_string(),
            database: "trading_guard".to_string(),
            batch_size: 500,
            flush_period_secs: 2,
        }
    }
}

impl From<TomlConfig> for GuardConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            log_level: toml.general.log_level,
            admin_key: None, // Always from env vars
            server: ServerConfig {
                host: toml.server.host,
                api_port: toml.server.api_port,
                push_port: toml.server.push_port,
                max_clients: toml.server.max_clients,
                enable_cors: toml.server.enable_cors,
            },
            confirmation: ConfirmationConfig {
                ttl: Duration::from_secs(toml.confirmation.ttl_secs),
                purge_grace: Duration::from_secs(toml.confirmation.purge_grace_secs),
            },
            broadcast: BroadcastConfig {
                retention: toml.broadcast.retention,
                observer_queue_capacity: toml.broadcast.observer_queue_capacity,
                heartbeat_interval: Duration::from_millis(toml.broadcast.heartbeat_interval_ms),
                max_missed_heartbeats: toml.broadcast.max_missed_heartbeats,
                tap_capacity: toml.broadcast.tap_capacity,
            },
            providers: ProviderConfig {
                balance_timeout: Duration::from_millis(toml.providers.balance_timeout_ms),
                max_concurrency: toml.providers.max_concurrency,
                retry_attempts: toml.providers.retry_attempts,
                retry_base_delay: Duration::from_millis(toml.providers.retry_base_delay_ms),
                session_cache_ttl: Duration::from_secs(toml.providers.session_cache_ttl_secs),
                identity_url: toml.providers.identity_url,
                vault_url: toml.providers.vault_url,
                polymarket_balance_url: toml.providers.balance_urls.polymarket,
                kalshi_balance_url: toml.providers.balance_urls.kalshi,
                execution_url: toml.providers.execution_url,
            },
            execution: ExecutionConfig {
                delivery_ttl: Duration::from_secs(toml.execution.delivery_ttl_secs),
                retry_interval: Duration::from_millis(toml.execution.retry_interval_ms),
            },
            clickhouse: ClickHouseConfig {
                enabled: toml.clickhouse.enabled,
                url: toml.clickhouse.url,
                database: toml.clickhouse.database,
                user: None,
                password: None,
                batch_size: toml.clickhouse.batch_size,
                flush_period: Duration::from_secs(toml.clickhouse.flush_period_secs),
            },
        }
    }
}

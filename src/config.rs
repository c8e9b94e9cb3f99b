//! Configuration loading and constants.
//!
//! Loads engine configuration from a TOML file and defines constants for
//! queue capacities, retry/backoff timing, batch-writer thresholds, and
//! default paths. `AppConfig` is the root configuration struct; each
//! subsystem gets its own nested section so the file on disk mirrors
//! the module layout.

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

// =============================================================================
// History store constants
// =============================================================================

/// Minimum and maximum short-hash width, in hex nibbles (§4.1).
pub const SHORT_HASH_MIN: u8 = 2;
pub const SHORT_HASH_MAX: u8 = 7;

/// Default short-hash width for a brand new catalog.
pub const DEFAULT_SHORT_HASH_WIDTH: u8 = 5;

/// Capacity of the bounded queue in front of the history writer task.
pub const HISTORY_WRITER_QUEUE_CAPACITY: usize = 4096;

/// Group-commit interval: the writer fsyncs at most this often even under
/// continuous load, to bound durability lag without fsyncing every record.
pub const HISTORY_GROUP_COMMIT_INTERVAL_MS: u64 = 200;

/// Magic bytes prefixing every on-disk log frame.
pub const HISTORY_LOG_MAGIC: [u8; 4] = *b"HST1";

// =============================================================================
// Storage sharding constants
// =============================================================================

/// Soft cap on open shards: above this, idle shards become eligible for LRU close.
pub const SHARD_POOL_SOFT_CAP: usize = 64;

/// Hard cap on open shards: `GetShard` blocks (fair FIFO) above this.
pub const SHARD_POOL_HARD_CAP: usize = 256;

/// Minimum idle time before a shard may be LRU-closed, to damp thrash from
/// bursty access patterns (seconds).
pub const SHARD_MIN_IDLE_SECS: u64 = 30;

/// Per-shard batch writer: flush after this many queued rows...
pub const BATCH_WRITER_MAX_ROWS: usize = 500;
/// ...or after this many milliseconds, whichever comes first.
pub const BATCH_WRITER_MAX_DELAY_MS: u64 = 250;

/// Write retry attempts before surfacing a `StorageError`.
pub const BATCH_WRITER_MAX_RETRIES: u32 = 5;
/// Base backoff for batch-writer retries (doubled, jittered, each attempt).
pub const BATCH_WRITER_RETRY_BASE_MS: u64 = 50;

// =============================================================================
// NNTP protocol engine constants
// =============================================================================

/// Default plaintext NNTP port.
pub const DEFAULT_NNTP_PORT: u16 = 119;
/// Default NNTP-over-TLS port.
pub const DEFAULT_NNTPS_PORT: u16 = 563;

/// Maximum accepted article size in bytes; larger transfers are aborted.
pub const DEFAULT_MAX_ARTICLE_BYTES: u64 = 1 << 20;

/// TTL for the successful-auth cache (minutes), avoiding a hash per command.
pub const AUTH_CACHE_TTL_MINUTES: u64 = 15;

/// Failed AUTHINFO attempts before an account is temporarily locked.
pub const AUTH_MAX_FAILURES: u32 = 5;
/// Lockout duration once `AUTH_MAX_FAILURES` is reached.
pub const AUTH_LOCKOUT_SECS: u64 = 300;

/// Bounded queue depth for ingest (POST/IHAVE/TAKETHIS) awaiting a batch writer slot.
pub const INGEST_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// Fetch/ingest processor constants
// =============================================================================

/// Per-provider connection pool size.
pub const DEFAULT_PROVIDER_POOL_SIZE: usize = 8;

/// XOVER batch size per round-trip during the download loop.
pub const DEFAULT_FETCH_BATCH_SIZE: u64 = 2000;

/// Sleep between download-loop passes once every active group is `up2date`.
pub const DEFAULT_FETCH_SLEEP_SECS: u64 = 60;

/// Groups with fewer than this many provider-side articles are skipped on
/// first fetch (tiny-group filter, §4.5), 0 disables the filter.
pub const DEFAULT_TINY_GROUP_THRESHOLD: u64 = 0;

/// Provider connection idle timeout before the pool discards and replaces it.
pub const PROVIDER_IDLE_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// Overview/thread tree cache
// =============================================================================

pub const THREAD_TREE_CACHE_MAX_ENTRIES: u64 = 2000;
pub const THREAD_TREE_CACHE_TTL_SECS: u64 = 60;

// =============================================================================
// Misc / environment
// =============================================================================

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/archnews.toml";

/// Default log filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "archnews=info";

/// Default log format (`text` or `json`).
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Interval at which the `.update` sentinel file is polled (§6).
pub const UPDATE_SENTINEL_POLL_SECS: u64 = 60;

/// Threshold above which a re-parsed `date_sent` is treated as authoritative
/// over the previously stored value (§9 open question).
pub const DATE_REPAIR_AUTHORITY_THRESHOLD_SECS: i64 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub history: HistoryConfig,
    pub storage: StorageConfig,
    pub nntp: NntpServerSettings,
    #[serde(default)]
    pub provider: Vec<ProviderConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine-wide identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Hostname used in `Path:` and generated message-ids. Required before
    /// any POST or fetch operation runs (§9).
    pub hostname: Option<String>,
    /// Directory holding the catalog DB, group shards, and history log.
    pub data_dir: String,
}

impl EngineConfig {
    pub fn require_hostname(&self) -> Result<&str, ConfigError> {
        self.hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingHostname)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Short-hash width in hex nibbles, 2..=7. Locked in the catalog on first
    /// use; a later mismatch is a fatal startup error (§4.1, §8 scenario 5).
    #[serde(default = "HistoryConfig::default_short_hash_width")]
    pub short_hash_width: u8,
}

impl HistoryConfig {
    fn default_short_hash_width() -> u8 {
        DEFAULT_SHORT_HASH_WIDTH
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(SHORT_HASH_MIN..=SHORT_HASH_MAX).contains(&self.short_hash_width) {
            return Err(ConfigError::Invalid(format!(
                "history.short_hash_width must be {}..={}, got {}",
                SHORT_HASH_MIN, SHORT_HASH_MAX, self.short_hash_width
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_soft_cap")]
    pub shard_pool_soft_cap: usize,
    #[serde(default = "StorageConfig::default_hard_cap")]
    pub shard_pool_hard_cap: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shard_pool_soft_cap: Self::default_soft_cap(),
            shard_pool_hard_cap: Self::default_hard_cap(),
        }
    }
}

impl StorageConfig {
    fn default_soft_cap() -> usize {
        SHARD_POOL_SOFT_CAP
    }
    fn default_hard_cap() -> usize {
        SHARD_POOL_HARD_CAP
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NntpServerSettings {
    pub bind_host: String,
    #[serde(default = "NntpServerSettings::default_port")]
    pub port: u16,
    /// TLS port; `None` disables the TLS listener.
    pub tls_port: Option<u16>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    #[serde(default = "NntpServerSettings::default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "NntpServerSettings::default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "NntpServerSettings::default_max_article_bytes")]
    pub max_article_bytes: u64,
}

impl NntpServerSettings {
    fn default_port() -> u16 {
        DEFAULT_NNTP_PORT
    }
    fn default_max_connections() -> usize {
        512
    }
    fn default_max_connections_per_user() -> usize {
        8
    }
    fn default_max_article_bytes() -> u64 {
        DEFAULT_MAX_ARTICLE_BYTES
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_port.is_some() && self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

/// Configuration for a single upstream NNTP provider (fetch/ingest processor).
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Lower ranks are tried first (§4.5).
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "ProviderConfig::default_pool_size")]
    pub pool_size: usize,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "ProviderConfig::default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub tiny_group_threshold: u64,
}

impl ProviderConfig {
    fn default_pool_size() -> usize {
        DEFAULT_PROVIDER_POOL_SIZE
    }
    fn default_timeout() -> u64 {
        30
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Credentials must never be sent over an unencrypted connection.
    pub fn requires_tls_for_credentials(&self) -> bool {
        self.has_credentials()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `text` (human-readable) or `json` (structured, production default).
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })?;

        config.history.validate()?;
        if config.provider.is_empty() {
            tracing::warn!("no [[provider]] sections configured; fetch/ingest will never run");
        }
        for p in &config.provider {
            if p.requires_tls_for_credentials() && !config.nntp.tls_enabled() {
                tracing::debug!(
                    provider = %p.name,
                    "provider has credentials configured; connections will be opportunistic-TLS"
                );
            }
        }

        Ok(config)
    }
}

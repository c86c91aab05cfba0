use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Group used when a caller does not name one
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub selection: SelectionConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

/// Registry endpoint, credentials and namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(alias = "ipAddr")]
    pub ip_addr: String,
    /// Kept wider than `u16` so out-of-range values are reported by `validate`
    pub port: u32,
    pub username: String,
    pub password: String,
    /// Empty string selects the public namespace; `None` is a configuration error
    #[serde(alias = "namespaceId")]
    pub namespace_id: Option<String>,
    pub group: String,
    pub context_path: String,
    pub request_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ip_addr: "127.0.0.1".to_string(),
            port: 8848,
            username: String::new(),
            password: String::new(),
            namespace_id: None,
            group: DEFAULT_GROUP.to_string(),
            context_path: "/nacos".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which a view is served stale and refreshed in the background
    pub ttl_ms: u64,
    /// Age after which a view is no longer served at all
    pub max_staleness_ms: u64,
    /// How long a caller blocks on the first fetch of an unseen service.
    ///
    /// With the default retry budget the backoff alone sums to about 3s, so an
    /// unreachable registry surfaces as `Timeout` on a first lookup. Lower
    /// `retry.max_attempts` or raise this to see `Unreachable` instead.
    pub first_fetch_timeout_ms: u64,
    /// Re-authenticate when the token expires within this window
    pub token_grace_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            max_staleness_ms: 300_000,
            first_fetch_timeout_ms: 3000,
            token_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Pick among unhealthy instances instead of failing when none is healthy
    pub fallback_to_unhealthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 5000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl RegistryConfig {
    /// `host:port` of the registry
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip_addr, self.port)
    }

    /// Base URL for the registry's HTTP API
    #[must_use]
    pub fn base_url(&self) -> String {
        let context = self.context_path.trim_end_matches('/');
        format!("http://{}{}", self.endpoint(), context)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Whether a login is required before talking to the registry
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub const fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }

    #[must_use]
    pub const fn first_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.first_fetch_timeout_ms)
    }

    #[must_use]
    pub const fn token_grace(&self) -> Duration {
        Duration::from_secs(self.token_grace_secs)
    }

    /// Refresh tick interval: half the ttl, capped at ten seconds
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        (self.ttl() / 2)
            .min(Duration::from_secs(10))
            .max(Duration::from_millis(1))
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            } else {
                return Err(Error::Config(format!("config file {path} does not exist")));
            }
        }

        // XNACOS_REGISTRY__IP_ADDR, XNACOS_CACHE__TTL_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("XNACOS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.registry.ip_addr.trim().is_empty() {
            problems.push("registry.ip_addr must not be empty".to_string());
        }
        if !(1..=u32::from(u16::MAX)).contains(&self.registry.port) {
            problems.push(format!(
                "registry.port must be in [1, 65535], got {}",
                self.registry.port
            ));
        }
        if self.registry.namespace_id.is_none() {
            problems.push("registry.namespace_id is required".to_string());
        }
        if self.registry.has_credentials() && self.registry.password.is_empty() {
            problems.push("registry.password is required when a username is set".to_string());
        }
        if self.registry.group.trim().is_empty() {
            problems.push("registry.group must not be empty".to_string());
        }
        if self.cache.ttl_ms == 0 {
            problems.push("cache.ttl_ms must be positive".to_string());
        }
        if self.cache.max_staleness_ms < self.cache.ttl_ms {
            problems.push("cache.max_staleness_ms must not be below cache.ttl_ms".to_string());
        }
        if self.cache.first_fetch_timeout_ms == 0 {
            problems.push("cache.first_fetch_timeout_ms must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            problems.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

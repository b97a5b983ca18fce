//! Configuration management for Tollgate.

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{FailureMode, LimiterSettings, RateLimitRules, DEFAULT_KEY_PREFIX};

/// Prefix for environment overrides, e.g. `TOLLGATE__SERVER__HTTP_ADDR`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Bearer token validation
    #[serde(default)]
    pub auth: AuthConfig,

    /// Bucket store selection
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML policy table; takes precedence over `rules`
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline policy table
    #[serde(default)]
    pub rules: RateLimitRules,

    /// Policy table reload interval in seconds, 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub config_reload_interval_secs: u64,

    /// What happens to requests while the bucket store is unavailable
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Bound on each bucket store call, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Minimum bucket expiry in seconds
    #[serde(default = "default_min_bucket_ttl")]
    pub min_bucket_ttl_secs: u64,

    /// Compare-and-set rounds before a contended update gives up
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            rules: RateLimitRules::default(),
            config_reload_interval_secs: default_reload_interval(),
            failure_mode: FailureMode::default(),
            store_timeout_ms: default_store_timeout(),
            min_bucket_ttl_secs: default_min_bucket_ttl(),
            max_cas_attempts: default_max_cas_attempts(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

fn default_store_timeout() -> u64 {
    100
}

fn default_min_bucket_ttl() -> u64 {
    60
}

fn default_max_cas_attempts() -> u32 {
    32
}

impl RateLimitingConfig {
    /// Limiter tunables derived from this section.
    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            failure_mode: self.failure_mode,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            min_bucket_ttl: Duration::from_secs(self.min_bucket_ttl_secs),
            max_cas_attempts: self.max_cas_attempts,
        }
    }

    /// The initial policy table, from `rules_path` if set.
    pub fn load_rules(&self) -> Result<RateLimitRules> {
        match &self.rules_path {
            Some(path) => RateLimitRules::from_file(path),
            None => self.rules.clone().validated(),
        }
    }

    /// Interval for the rules reloader, if reloading applies.
    pub fn reload_interval(&self) -> Option<Duration> {
        match (&self.rules_path, self.config_reload_interval_secs) {
            (Some(_), secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }
}

/// Bearer token validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for HMAC-signed tokens. Without it only identities
    /// attached upstream are recognized.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Accepted signing algorithm
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: Algorithm,

    /// Allowed clock skew for `exp`, in seconds
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_algorithm: default_jwt_algorithm(),
            leeway_secs: default_leeway(),
        }
    }
}

fn default_jwt_algorithm() -> Algorithm {
    Algorithm::HS256
}

fn default_leeway() -> u64 {
    60
}

/// Which bucket store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process; buckets are not shared between instances
    #[default]
    Memory,
    /// Shared redis server
    Redis,
}

/// Bucket store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix of every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply
    /// `TOLLGATE__SECTION__FIELD` environment overrides.
    ///
    /// The layered loader folds keys to lowercase, so the path overrides
    /// are taken from the file as written.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let mut config: TollgateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        if let Some(path) = path {
            config.rate_limiting.rules.paths = Self::from_file(path)?.rate_limiting.rules.paths;
        }
        Ok(config)
    }
}

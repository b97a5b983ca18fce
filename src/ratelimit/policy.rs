//! Rate limit policy table and per-route policy resolution.
//!
//! The table maps a resource path to a `(tokens, refill_rate)` override and
//! falls back to global defaults for any path it does not name.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Default bucket capacity when no path override applies.
const DEFAULT_TOKENS: f64 = 10.0;
/// Default refill rate (tokens per second) when no path override applies.
const DEFAULT_REFILL_RATE: f64 = 1.0;

/// The effective limit applied to one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    /// Maximum number of tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl RateLimitPolicy {
    /// Create a policy, rejecting non-positive or non-finite values.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        check_positive("capacity", capacity)?;
        check_positive("refill_rate", refill_rate)?;
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    /// Time needed to refill an empty bucket to capacity, saturating at
    /// `Duration::MAX` for policies too slow to represent.
    pub fn time_to_full(&self) -> Duration {
        Duration::try_from_secs_f64(self.capacity / self.refill_rate).unwrap_or(Duration::MAX)
    }
}

/// A per-path override in the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathRule {
    /// Bucket capacity for this path
    pub tokens: f64,
    /// Refill rate for this path, in tokens per second
    pub refill_rate: f64,
}

/// The policy table: global defaults plus per-path overrides.
///
/// ```yaml
/// default_tokens: 10
/// default_refill_rate: 1
/// paths:
///   /api/test:
///     tokens: 5
///     refill_rate: 0.5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Capacity used for paths without an override
    #[serde(default = "default_tokens")]
    pub default_tokens: f64,

    /// Refill rate used for paths without an override
    #[serde(default = "default_refill_rate")]
    pub default_refill_rate: f64,

    /// Map of resource path to override
    #[serde(default)]
    pub paths: HashMap<String, PathRule>,
}

fn default_tokens() -> f64 {
    DEFAULT_TOKENS
}

fn default_refill_rate() -> f64 {
    DEFAULT_REFILL_RATE
}

impl Default for RateLimitRules {
    fn default() -> Self {
        Self {
            default_tokens: DEFAULT_TOKENS,
            default_refill_rate: DEFAULT_REFILL_RATE,
            paths: HashMap::new(),
        }
    }
}

impl RateLimitRules {
    /// Load a policy table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse rate limit rules: {}", e))
        })?;
        rules.validated()
    }

    /// Check every value and normalize the path keys.
    ///
    /// Tables coming from files or the environment pass through here, so
    /// `resolve` can hand out policies without re-checking them.
    pub fn validated(self) -> Result<Self> {
        check_positive("default_tokens", self.default_tokens)?;
        check_positive("default_refill_rate", self.default_refill_rate)?;

        let mut paths = HashMap::with_capacity(self.paths.len());
        for (path, rule) in self.paths {
            check_positive(&format!("paths.{}.tokens", path), rule.tokens)?;
            check_positive(&format!("paths.{}.refill_rate", path), rule.refill_rate)?;
            paths.insert(normalize_path(&path), rule);
        }

        Ok(Self {
            default_tokens: self.default_tokens,
            default_refill_rate: self.default_refill_rate,
            paths,
        })
    }

    /// The policy applied to paths without an override.
    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            capacity: self.default_tokens,
            refill_rate: self.default_refill_rate,
        }
    }

    /// Resolve the effective policy for a resource path.
    ///
    /// Unconfigured paths get the defaults; this never fails.
    pub fn resolve(&self, resource_path: &str) -> RateLimitPolicy {
        match self.paths.get(&normalize_path(resource_path)) {
            Some(rule) => RateLimitPolicy {
                capacity: rule.tokens,
                refill_rate: rule.refill_rate,
            },
            None => self.default_policy(),
        }
    }
}

/// Normalize a resource path: leading slash, no trailing slash, root kept.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TollgateError::Config(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

/// Shared handle to the current policy table.
///
/// Requests take an immutable snapshot; `replace` is the only reload
/// boundary, so a request never observes a half-applied table.
#[derive(Debug)]
pub struct RulesHandle {
    current: RwLock<Arc<RateLimitRules>>,
}

impl RulesHandle {
    /// Create a handle around an initial table.
    pub fn new(rules: RateLimitRules) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// Snapshot of the table in effect right now.
    pub fn snapshot(&self) -> Arc<RateLimitRules> {
        self.current.read().clone()
    }

    /// Swap in a new table. Requests already holding a snapshot keep theirs.
    pub fn replace(&self, rules: RateLimitRules) {
        *self.current.write() = Arc::new(rules);
    }
}

impl Default for RulesHandle {
    fn default() -> Self {
        Self::new(RateLimitRules::default())
    }
}

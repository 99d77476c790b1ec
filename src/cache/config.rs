//! Response cache configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::{Method, config::ConfigError};

const DEFAULT_TTL_MS: u64 = 15 * 60 * 1000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 500;
const DEFAULT_KEY_PREFIX: &str = "cache";

/// Which caching policy the pipeline applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Reads fill the cache on miss; writes go straight to the origin and only
    /// methods listed in `invalidate_on` drop the cached entries.
    #[default]
    CacheAside,
    /// Reads as Cache-Aside. A `200 OK` to POST, PUT or PATCH replaces the
    /// cached GET entry; any other successful mutation (`201`, `204`, DELETE)
    /// drops it.
    WriteThrough,
}

/// Response cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a stored entry (ms). Must be greater than zero.
    pub ttl_ms: u64,
    /// Namespace prepended to every key.
    pub key_prefix: String,
    /// Query parameters that do not contribute to the key (tracking params etc.).
    pub ignore_params: Vec<String>,
    /// Path prefixes that are never cached.
    pub exclude_paths: Vec<String>,
    pub strategy: CacheStrategy,
    /// Mutating methods whose success invalidates the GET and HEAD entries.
    /// Write-Through invalidates on every successful mutation regardless.
    pub invalidate_on: Vec<Method>,
    /// Upper bound for a single store operation (ms), on top of the request deadline.
    pub store_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ignore_params: Vec::new(),
            exclude_paths: Vec::new(),
            strategy: CacheStrategy::default(),
            invalidate_on: Vec::new(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_ms == 0 {
            return Err(ConfigError::invalid("cache.ttl_ms", "must be greater than zero"));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "cache.store_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::invalid("cache.key_prefix", "must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub(crate) fn is_ignored(&self, param: &str) -> bool {
        self.ignore_params.iter().any(|name| name == param)
    }
}

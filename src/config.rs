//! Pipeline configuration with environment-variable overrides.

use crate::circuit_breaker::BreakerConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Errors produced when validating pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Breaker thresholds or timeouts out of range.
    #[error(transparent)]
    Breaker(#[from] BreakerConfigError),
    /// Cache TTL must be > 0.
    #[error("cache_ttl must be > 0")]
    ZeroCacheTtl,
    /// Dedup window must be > 0.
    #[error("dedup_window must be > 0")]
    ZeroDedupWindow,
    /// Pool capacity must be > 0.
    #[error("max_handles must be > 0")]
    ZeroPoolCapacity,
}

/// Tunables for every pipeline component.
///
/// All values can be overridden through `BREAKWATER_*` environment variables
/// with sensible defaults; see [`PipelineConfig::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Lifetime of a cached response.
    pub cache_ttl: Duration,
    /// Window inside which identical requests are deduplicated.
    pub dedup_window: Duration,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// Time the circuit stays open before admitting trials.
    pub recovery_timeout: Duration,
    /// Maximum concurrent half-open trials.
    pub half_open_max_probes: usize,
    /// Resource pool capacity.
    pub max_handles: usize,
    /// Age at which a pooled handle is no longer reusable.
    pub idle_timeout: Duration,
    /// Per-request RSS growth that triggers a monitor warning.
    pub memory_growth_warn_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            dedup_window: Duration::from_secs(5),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
            max_handles: 10,
            idle_timeout: Duration::from_secs(60),
            memory_growth_warn_bytes: 32 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// # Environment variables
    /// - `BREAKWATER_CACHE_TTL_SECS` (default: 300)
    /// - `BREAKWATER_DEDUP_WINDOW_MS` (default: 5000)
    /// - `BREAKWATER_FAILURE_THRESHOLD` (default: 5)
    /// - `BREAKWATER_RECOVERY_TIMEOUT_SECS` (default: 30)
    /// - `BREAKWATER_HALF_OPEN_MAX_PROBES` (default: 1)
    /// - `BREAKWATER_MAX_HANDLES` (default: 10)
    /// - `BREAKWATER_IDLE_TIMEOUT_SECS` (default: 60)
    /// - `BREAKWATER_MEMORY_WARN_BYTES` (default: 33554432)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_ttl: env_secs("BREAKWATER_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl),
            dedup_window: env_millis("BREAKWATER_DEDUP_WINDOW_MS").unwrap_or(defaults.dedup_window),
            failure_threshold: env_parse("BREAKWATER_FAILURE_THRESHOLD")
                .unwrap_or(defaults.failure_threshold),
            recovery_timeout: env_secs("BREAKWATER_RECOVERY_TIMEOUT_SECS")
                .unwrap_or(defaults.recovery_timeout),
            half_open_max_probes: env_parse("BREAKWATER_HALF_OPEN_MAX_PROBES")
                .unwrap_or(defaults.half_open_max_probes),
            max_handles: env_parse("BREAKWATER_MAX_HANDLES").unwrap_or(defaults.max_handles),
            idle_timeout: env_secs("BREAKWATER_IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            memory_growth_warn_bytes: env_parse("BREAKWATER_MEMORY_WARN_BYTES")
                .unwrap_or(defaults.memory_growth_warn_bytes),
        }
    }

    /// Check every field before components are built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl == Duration::ZERO {
            return Err(ConfigError::ZeroCacheTtl);
        }
        if self.dedup_window == Duration::ZERO {
            return Err(ConfigError::ZeroDedupWindow);
        }
        if self.max_handles == 0 {
            return Err(ConfigError::ZeroPoolCapacity);
        }
        crate::circuit_breaker::BreakerConfig::new(
            self.failure_threshold,
            self.recovery_timeout,
            self.half_open_max_probes,
        )?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

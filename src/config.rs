//! Process configuration for the admission layer.
//!
//! Settings come from JSON (for example a section of a larger config file) or
//! from the environment. Every field has a default so partial documents are
//! accepted:
//!
//! ```
//! use tollgate::AdmissionConfig;
//!
//! let cfg = AdmissionConfig::from_json(
//!     r#"{ "default_capacity": 200, "eviction": "least_recently_used" }"#,
//! )
//! .unwrap();
//! assert_eq!(cfg.default_capacity, 200);
//! assert_eq!(cfg.default_refill_per_sec, 10.0);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::identity::DEFAULT_FORWARDED_HEADER;
use crate::policy::{BucketLimits, DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC};
use crate::registry::{
    EvictionPolicy, DEFAULT_CLEANUP_INTERVAL, DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER,
};

/// Paths that never pass through admission control.
pub const DEFAULT_BYPASS_PATHS: [&str; 4] = ["/health", "/docs", "/openapi.json", "/favicon.ico"];

/// Environment variable overriding [`AdmissionConfig::default_capacity`].
pub const ENV_CAPACITY: &str = "RATE_LIMIT_CAPACITY";
/// Environment variable overriding [`AdmissionConfig::default_refill_per_sec`].
pub const ENV_REFILL: &str = "RATE_LIMIT_REFILL";
/// Environment variable overriding [`AdmissionConfig::cleanup_interval_secs`].
pub const ENV_CLEANUP_SECS: &str = "RATE_LIMIT_CLEANUP_SECS";
/// Environment variable overriding [`AdmissionConfig::eviction`].
pub const ENV_EVICTION: &str = "RATE_LIMIT_EVICTION";

/// Admission-control settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Capacity of endpoints without a specific policy.
    pub default_capacity: u32,
    /// Refill rate (tokens/second) of endpoints without a specific policy.
    pub default_refill_per_sec: f64,
    /// Minimum seconds between eviction passes.
    pub cleanup_interval_secs: u64,
    /// Registry size that triggers trimming.
    pub high_water: usize,
    /// Registry size kept after trimming.
    pub low_water: usize,
    /// Which buckets survive trimming.
    pub eviction: EvictionPolicy,
    /// Trusted header carrying the original client address.
    pub forwarded_header: String,
    /// Operational paths exempt from admission control.
    pub bypass_paths: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_CAPACITY,
            default_refill_per_sec: DEFAULT_REFILL_PER_SEC,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL.as_secs(),
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            eviction: EvictionPolicy::default(),
            forwarded_header: DEFAULT_FORWARDED_HEADER.to_string(),
            bypass_paths: DEFAULT_BYPASS_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl AdmissionConfig {
    /// Defaults overridden by `RATE_LIMIT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `RATE_LIMIT_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_CAPACITY) {
            cfg.default_capacity = parse_env(ENV_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REFILL) {
            cfg.default_refill_per_sec = parse_env(ENV_REFILL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CLEANUP_SECS) {
            cfg.cleanup_interval_secs = parse_env(ENV_CLEANUP_SECS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_EVICTION) {
            cfg.eviction = match raw.trim() {
                "insertion_order" => EvictionPolicy::InsertionOrder,
                "least_recently_used" | "lru" => EvictionPolicy::LeastRecentlyUsed,
                _ => return Err(ConfigError::InvalidEnv { var: ENV_EVICTION, value: raw }),
            };
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Decode and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check limits and watermarks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_limits()?;
        if self.low_water > self.high_water {
            return Err(ConfigError::InvalidWatermarks {
                high: self.high_water,
                low: self.low_water,
            });
        }
        Ok(())
    }

    /// Fallback bucket limits.
    pub fn default_limits(&self) -> Result<BucketLimits, ConfigError> {
        BucketLimits::new(self.default_capacity, self.default_refill_per_sec)
    }

    /// Minimum time between eviction passes.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv { var, value: raw.to_string() })
}

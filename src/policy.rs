//! Endpoint quota policies.
//!
//! A [`PolicyTable`] maps a route path to the [`BucketLimits`] used when a bucket
//! is first created for that endpoint. Lookups are exact string matches and fall
//! back to the table's explicit default entry.

use std::collections::HashMap;

use crate::error::ConfigError;

/// Capacity used when nothing else is configured.
pub const DEFAULT_CAPACITY: u32 = 100;
/// Refill rate (tokens/second) used when nothing else is configured.
pub const DEFAULT_REFILL_PER_SEC: f64 = 10.0;

/// Validated bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    capacity: u32,
    refill_per_sec: f64,
}

impl BucketLimits {
    /// Create limits, rejecting a zero capacity or a negative/non-finite refill rate.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity { provided: capacity });
        }
        if !refill_per_sec.is_finite() || refill_per_sec < 0.0 {
            return Err(ConfigError::InvalidRefillRate { provided: refill_per_sec });
        }
        Ok(Self { capacity, refill_per_sec })
    }

    /// Maximum tokens (burst size).
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }
}

impl Default for BucketLimits {
    fn default() -> Self {
        Self { capacity: DEFAULT_CAPACITY, refill_per_sec: DEFAULT_REFILL_PER_SEC }
    }
}

/// Endpoint → limits lookup with a first-class default.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    default: BucketLimits,
    endpoints: HashMap<String, BucketLimits>,
}

impl PolicyTable {
    /// Table with no endpoint overrides.
    pub fn uniform(default: BucketLimits) -> Self {
        Self { default, endpoints: HashMap::new() }
    }

    /// The shipped table: costly search, route analysis and analytics endpoints
    /// get tighter quotas than `default`.
    pub fn standard(default: BucketLimits) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "/autocomplete".to_string(),
            BucketLimits { capacity: 50, refill_per_sec: 5.0 },
        );
        endpoints.insert(
            "/analyze-route".to_string(),
            BucketLimits { capacity: 20, refill_per_sec: 2.0 },
        );
        endpoints.insert(
            "/api/analytics".to_string(),
            BucketLimits { capacity: 30, refill_per_sec: 3.0 },
        );
        Self { default, endpoints }
    }

    /// Start building a custom table.
    pub fn builder() -> PolicyTableBuilder {
        PolicyTableBuilder::default()
    }

    /// Limits for `endpoint`, or the default entry when no exact match exists.
    pub fn limits_for(&self, endpoint: &str) -> BucketLimits {
        self.endpoints.get(endpoint).copied().unwrap_or(self.default)
    }

    /// The fallback entry.
    pub fn default_limits(&self) -> BucketLimits {
        self.default
    }

    /// Number of endpoint-specific entries.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// True when only the default entry exists.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard(BucketLimits::default())
    }
}

/// Builder for [`PolicyTable`].
#[derive(Debug, Default)]
pub struct PolicyTableBuilder {
    default: Option<BucketLimits>,
    endpoints: HashMap<String, BucketLimits>,
}

impl PolicyTableBuilder {
    /// Set the fallback entry (defaults to 100 tokens, 10/s).
    pub fn default_limits(mut self, limits: BucketLimits) -> Self {
        self.default = Some(limits);
        self
    }

    /// Add or replace an endpoint entry.
    pub fn endpoint(mut self, path: impl Into<String>, limits: BucketLimits) -> Self {
        self.endpoints.insert(path.into(), limits);
        self
    }

    /// Finish the table.
    pub fn build(self) -> PolicyTable {
        PolicyTable { default: self.default.unwrap_or_default(), endpoints: self.endpoints }
    }
}

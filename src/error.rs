//! Error types for building admission-control components.
//!
//! Admission outcomes are never errors: a throttled request is an ordinary
//! decision. These errors only surface while turning configuration into a
//! policy table, registry or layer.

/// Errors produced when validating limits or loading configuration.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// Bucket capacity must be > 0.
    #[error("bucket capacity must be > 0 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: u32,
    },
    /// Refill rate must be finite and >= 0.
    #[error("refill rate must be finite and >= 0 (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Eviction must trim down, never up.
    #[error("low-water mark ({low}) must not exceed high-water mark ({high})")]
    InvalidWatermarks {
        /// Size that triggers eviction.
        high: usize,
        /// Size retained after eviction.
        low: usize,
    },
    /// An environment variable held an unparsable value.
    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value found in the environment.
        value: String,
    },
    /// The forwarding header name is not a valid HTTP header name.
    #[error("invalid forwarding header name {name:?}")]
    InvalidHeaderName {
        /// Name supplied in configuration.
        name: String,
        /// Parser error.
        #[source]
        source: http::header::InvalidHeaderName,
    },
    /// JSON configuration could not be decoded.
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Check if this error came from the process environment.
    pub fn is_env(&self) -> bool {
        matches!(self, Self::InvalidEnv { .. })
    }

    /// Check if this error rejects a bucket's limits.
    pub fn is_invalid_limits(&self) -> bool {
        matches!(self, Self::InvalidCapacity { .. } | Self::InvalidRefillRate { .. })
    }
}

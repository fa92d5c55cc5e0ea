//! Convenient re-exports for common Tollgate types.
pub use crate::{
    clock::{Clock, ManualClock, MonotonicClock},
    config::{AdmissionConfig, DEFAULT_BYPASS_PATHS},
    decision::{AdmissionDecision, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET},
    error::ConfigError,
    identity::{AuthenticatedPrincipal, ClientIdentifier, PeerAddr},
    layer::{AdmissionLayer, AdmissionService},
    policy::{BucketLimits, PolicyTable},
    registry::{BucketRegistry, EvictionPolicy},
    telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    token_bucket::TokenBucket,
};

#![forbid(unsafe_code)]

//! # Tollgate
//!
//! In-process admission control for `tower`/`http` services: every request is
//! charged against a token bucket keyed by client identity and endpoint, and
//! rejected with `429 Too Many Requests` once that bucket is empty.
//!
//! ## Features
//!
//! - **Token buckets** that start full, refill continuously and never exceed capacity
//! - **Per-endpoint policies** with a first-class default entry
//! - **Client identification** from an authenticated principal, a trusted
//!   forwarding header or the peer address
//! - **Bounded registry** with create-once buckets and periodic eviction
//! - **Quota headers** (`X-RateLimit-Limit`, `X-RateLimit-Remaining`,
//!   `X-RateLimit-Reset`) on every evaluated response
//! - **Telemetry** events delivered to pluggable `tower` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::{AdmissionConfig, AdmissionLayer, BucketRegistry, PolicyTable};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AdmissionConfig::default();
//!     let registry = Arc::new(BucketRegistry::from_config(&config).unwrap());
//!     let handler = service_fn(|_req: http::Request<String>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(String::from("hello")))
//!     });
//!     let svc = AdmissionLayer::new(registry).layer(handler);
//!
//!     let req = http::Request::builder().uri("/routes").body(String::new()).unwrap();
//!     let resp = svc.oneshot(req).await.unwrap();
//!     assert_eq!(resp.headers()["x-ratelimit-limit"], "100");
//!     assert_eq!(resp.headers()["x-ratelimit-remaining"], "99");
//! #   let _ = PolicyTable::default();
//! }
//! ```

pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod identity;
pub mod layer;
pub mod policy;
pub mod prelude;
pub mod registry;
pub mod telemetry;
pub mod token_bucket;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::AdmissionConfig;
pub use decision::{AdmissionDecision, RejectionBody};
pub use error::ConfigError;
pub use identity::{AuthenticatedPrincipal, ClientIdentifier, PeerAddr};
pub use layer::{AdmissionLayer, AdmissionService};
pub use policy::{BucketLimits, PolicyTable, PolicyTableBuilder};
pub use registry::{BucketRegistry, EvictionPolicy, EvictionReport, RegistryKey, RegistryStats};
pub use token_bucket::{Consumption, TokenBucket};

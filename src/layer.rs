//! Tower middleware that gates `http` requests on per-client, per-endpoint quotas.
//!
//! ```text
//! request ─► bypass path? ──yes──────────────────────────────► inner service
//!                 │ no
//!                 ▼
//!         eviction gate ─► identify client ─► registry.check(client, path)
//!                                                   │
//!                          allowed ◄────────────────┴───────────► denied
//!                             │                                     │
//!                 inner service + quota headers          429 + quota headers
//! ```
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::{AdmissionLayer, BucketRegistry};
//! use tower::{service_fn, Layer};
//!
//! let registry = Arc::new(BucketRegistry::default());
//! let svc = AdmissionLayer::new(registry).layer(service_fn(|_req: http::Request<String>| async {
//!     Ok::<_, std::convert::Infallible>(http::Response::new(String::from("ok")))
//! }));
//! # let _ = svc;
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, warn};

use crate::config::{AdmissionConfig, DEFAULT_BYPASS_PATHS};
use crate::error::ConfigError;
use crate::identity::ClientIdentifier;
use crate::registry::BucketRegistry;
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, TelemetrySink};

/// A layer that enforces quotas held in a shared [`BucketRegistry`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer<T = NullSink> {
    registry: Arc<BucketRegistry>,
    identifier: ClientIdentifier,
    bypass: Arc<HashSet<String>>,
    sink: T,
}

impl AdmissionLayer<NullSink> {
    /// Layer over `registry` with the default bypass paths and forwarding header.
    pub fn new(registry: Arc<BucketRegistry>) -> Self {
        Self {
            registry,
            identifier: ClientIdentifier::default(),
            bypass: Arc::new(DEFAULT_BYPASS_PATHS.iter().map(|p| p.to_string()).collect()),
            sink: NullSink,
        }
    }

    /// Build the registry and layer from process configuration.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        let registry = Arc::new(BucketRegistry::from_config(config)?);
        let identifier = ClientIdentifier::with_forwarded_header(&config.forwarded_header)?;
        Ok(Self::new(registry)
            .with_identifier(identifier)
            .with_bypass_paths(config.bypass_paths.iter().cloned()))
    }
}

impl<T> AdmissionLayer<T> {
    /// Replace the client identification strategy.
    pub fn with_identifier(mut self, identifier: ClientIdentifier) -> Self {
        self.identifier = identifier;
        self
    }

    /// Replace the set of paths exempt from admission control.
    pub fn with_bypass_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.bypass = Arc::new(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Send admission events to `sink`.
    pub fn with_sink<U>(self, sink: U) -> AdmissionLayer<U>
    where
        U: TelemetrySink,
    {
        AdmissionLayer {
            registry: self.registry,
            identifier: self.identifier,
            bypass: self.bypass,
            sink,
        }
    }

    /// Registry shared by every service this layer produces.
    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }
}

impl<S, T> Layer<S> for AdmissionLayer<T>
where
    T: Clone,
{
    type Service = AdmissionService<S, T>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            registry: self.registry.clone(),
            identifier: self.identifier.clone(),
            bypass: self.bypass.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Middleware service that enforces quotas.
#[derive(Clone, Debug)]
pub struct AdmissionService<S, T = NullSink> {
    inner: S,
    registry: Arc<BucketRegistry>,
    identifier: ClientIdentifier,
    bypass: Arc<HashSet<String>>,
    sink: T,
}

impl<S, T, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, T>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // Keep the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let sink = self.sink.clone();
        let endpoint = req.uri().path().to_string();

        if self.bypass.contains(&endpoint) {
            debug!(target: "tollgate::layer", endpoint = %endpoint, "admission bypassed");
            return Box::pin(async move {
                emit_best_effort(sink, AdmissionEvent::Bypassed { endpoint }).await;
                inner.call(req).await
            });
        }

        let eviction = self.registry.maybe_evict().filter(|report| report.removed > 0);
        let client = self.identifier.identify(&req);
        let decision = self.registry.check(&client, &endpoint);

        if !decision.allowed {
            warn!(
                target: "tollgate::layer",
                client = %client,
                endpoint = %endpoint,
                retry_after = decision.reset_secs,
                "rate limit exceeded"
            );
        }

        Box::pin(async move {
            if let Some(report) = eviction {
                let event =
                    AdmissionEvent::Evicted { removed: report.removed, retained: report.retained };
                emit_best_effort(sink.clone(), event).await;
            }

            if !decision.allowed {
                let event = AdmissionEvent::Throttled {
                    client,
                    endpoint,
                    retry_after: decision.reset_secs,
                };
                emit_best_effort(sink, event).await;
                return Ok(decision.into_rejection());
            }

            let event = AdmissionEvent::Admitted {
                client,
                endpoint,
                remaining: decision.remaining,
                limit: decision.limit,
            };
            emit_best_effort(sink, event).await;

            req.extensions_mut().insert(decision);
            let mut response = inner.call(req).await?;
            decision.apply_headers(response.headers_mut());
            Ok(response)
        })
    }
}

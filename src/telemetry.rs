//! Admission telemetry.
//!
//! The admission layer emits an [`AdmissionEvent`] for every request it sees
//! and for every eviction pass it triggers. Events flow into a
//! [`TelemetrySink`], which is simply a `tower::Service<AdmissionEvent>`, so
//! sinks compose with standard tower combinators.
//!
//! ```rust
//! use tollgate::telemetry::{AdmissionEvent, MemorySink};
//!
//! let sink = MemorySink::with_capacity(16);
//! let event = AdmissionEvent::Bypassed { endpoint: "/health".into() };
//! assert_eq!(event.to_string(), "bypassed /health");
//! # let _ = sink;
//! ```
//!
//! # Implementing a custom sink
//!
//! ```rust
//! use tollgate::telemetry::{AdmissionEvent, TelemetrySink};
//! use tower::Service;
//! use std::task::{Context, Poll};
//! use std::pin::Pin;
//! use std::future::Future;
//!
//! #[derive(Clone)]
//! struct StdoutSink;
//!
//! impl Service<AdmissionEvent> for StdoutSink {
//!     type Response = ();
//!     type Error = std::convert::Infallible;
//!     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
//!
//!     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
//!         Poll::Ready(Ok(()))
//!     }
//!
//!     fn call(&mut self, event: AdmissionEvent) -> Self::Future {
//!         println!("{event}");
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! impl TelemetrySink for StdoutSink {
//!     type SinkError = std::convert::Infallible;
//! }
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tower::Service;

/// Destination for [`AdmissionEvent`]s.
///
/// Blanket requirements let the layer clone the sink into each response future.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// Delivery failure; never surfaces to the client.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` once the sink reports ready.
///
/// A sink that errors in `poll_ready` or `call` loses the event; the request
/// outcome is unaffected.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted by the admission layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A request consumed a token and was forwarded.
    Admitted {
        /// Client identity.
        client: String,
        /// Endpoint identifier.
        endpoint: String,
        /// Whole tokens left.
        remaining: u32,
        /// Bucket capacity.
        limit: u32,
    },
    /// A request was rejected with 429.
    Throttled {
        /// Client identity.
        client: String,
        /// Endpoint identifier.
        endpoint: String,
        /// Retry hint in seconds.
        retry_after: u64,
    },
    /// A request hit an operational path and skipped admission control.
    Bypassed {
        /// Endpoint identifier.
        endpoint: String,
    },
    /// An eviction pass trimmed the registry.
    Evicted {
        /// Buckets dropped.
        removed: usize,
        /// Buckets left.
        retained: usize,
    },
}

impl AdmissionEvent {
    /// Whether this event records a rejection.
    pub fn is_throttled(&self) -> bool {
        matches!(self, AdmissionEvent::Throttled { .. })
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { client, endpoint, remaining, limit } => {
                write!(f, "admitted {client} on {endpoint} ({remaining}/{limit} left)")
            }
            AdmissionEvent::Throttled { client, endpoint, retry_after } => {
                write!(f, "throttled {client} on {endpoint} (retry in {retry_after}s)")
            }
            AdmissionEvent::Bypassed { endpoint } => write!(f, "bypassed {endpoint}"),
            AdmissionEvent::Evicted { removed, retained } => {
                write!(f, "evicted {removed} buckets ({retained} retained)")
            }
        }
    }
}

/// Default sink of [`AdmissionLayer`](crate::AdmissionLayer). Drops every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event to `tracing` under the `tollgate::telemetry` target.
///
/// Throttles log at `warn`, everything else at `debug`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        if event.is_throttled() {
            tracing::warn!(target: "tollgate::telemetry", %event, "request throttled");
        } else {
            tracing::debug!(target: "tollgate::telemetry", %event, "admission outcome");
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory.
///
/// Oldest events are dropped once `capacity` is reached; `evicted()` counts them.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Sink bounded to `capacity` events (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of stored events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the sink was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drop stored events.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttled(n: u64) -> AdmissionEvent {
        AdmissionEvent::Throttled {
            client: "ip:1.1.1.1".into(),
            endpoint: "/x".into(),
            retry_after: n,
        }
    }

    #[tokio::test]
    async fn memory_sink_records_in_order() {
        let sink = MemorySink::with_capacity(4);
        emit_best_effort(sink.clone(), throttled(1)).await;
        emit_best_effort(sink.clone(), AdmissionEvent::Evicted { removed: 3, retained: 2 }).await;
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_throttled());
        assert_eq!(events[1], AdmissionEvent::Evicted { removed: 3, retained: 2 });
    }

    #[tokio::test]
    async fn memory_sink_drops_oldest_when_full() {
        let sink = MemorySink::with_capacity(2);
        for n in 0..5 {
            emit_best_effort(sink.clone(), throttled(n)).await;
        }
        assert_eq!(sink.events(), vec![throttled(3), throttled(4)]);
        assert_eq!(sink.evicted(), 3);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        emit_best_effort(NullSink, throttled(1)).await;
        emit_best_effort(LogSink, throttled(1)).await;
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn log_sink_warns_on_throttle() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        emit_best_effort(LogSink, throttled(7)).await;
        emit_best_effort(LogSink, AdmissionEvent::Bypassed { endpoint: "/health".into() }).await;

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("tollgate::telemetry"));
        assert!(logs.contains("request throttled"));
        assert!(logs.contains("retry in 7s"));
        assert!(logs.contains("DEBUG"));
        assert!(logs.contains("bypassed /health"));
    }

    #[test]
    fn display_is_human_readable() {
        let admitted = AdmissionEvent::Admitted {
            client: "user:9".into(),
            endpoint: "/routes".into(),
            remaining: 4,
            limit: 5,
        };
        assert_eq!(admitted.to_string(), "admitted user:9 on /routes (4/5 left)");
        assert_eq!(throttled(3).to_string(), "throttled ip:1.1.1.1 on /x (retry in 3s)");
    }
}

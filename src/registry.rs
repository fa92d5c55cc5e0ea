//! Registry of token buckets keyed by `(client identity, endpoint)`.
//!
//! Buckets are created lazily on first observation of a key, using the
//! [`PolicyTable`] entry for the endpoint. The hot path is a read-locked lookup;
//! the rare creation and eviction paths take the write lock, which makes
//! creation insert-if-absent: racing creators converge on one instance.
//!
//! Memory is soft-bounded by an opportunistic eviction pass. Once per
//! `cleanup_interval` one caller wins the pass and, if the registry holds more
//! than `high_water` entries, trims it to `low_water`. Evicted clients simply get
//! a fresh, full bucket on their next request. A bucket evicted while a request
//! still holds it stays valid for that request and is unreachable afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::clock::{Clock, MonotonicClock};
use crate::config::AdmissionConfig;
use crate::decision::AdmissionDecision;
use crate::error::ConfigError;
use crate::policy::PolicyTable;
use crate::token_bucket::TokenBucket;

/// Minimum time between eviction passes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Size above which an eviction pass trims the registry.
pub const DEFAULT_HIGH_WATER: usize = 1000;
/// Entries retained by an eviction pass.
pub const DEFAULT_LOW_WATER: usize = 500;

/// Which entries survive an eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep the most recently *created* entries.
    ///
    /// Known limitation: a bucket created long ago but still in constant use can
    /// be evicted ahead of an idle bucket created later, resetting that client's
    /// quota to full.
    #[default]
    InsertionOrder,
    /// Keep the most recently *used* entries.
    LeastRecentlyUsed,
}

/// Composite registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    /// Client identity, e.g. `"ip:203.0.113.7"`.
    pub client: String,
    /// Endpoint identifier (route path).
    pub endpoint: String,
}

impl RegistryKey {
    /// Build a key from its parts.
    pub fn new(client: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { client: client.into(), endpoint: endpoint.into() }
    }
}

#[derive(Debug)]
struct Entry {
    bucket: Arc<TokenBucket>,
    sequence: u64,
    last_seen_millis: AtomicU64,
}

impl Entry {
    fn touch(&self, now_millis: u64) {
        self.last_seen_millis.fetch_max(now_millis, Ordering::Relaxed);
    }
}

impl EvictionPolicy {
    // Sequence numbers are unique, so ranks never tie.
    fn rank(self, entry: &Entry) -> (u64, u64) {
        match self {
            EvictionPolicy::InsertionOrder => (entry.sequence, 0),
            EvictionPolicy::LeastRecentlyUsed => {
                (entry.last_seen_millis.load(Ordering::Relaxed), entry.sequence)
            }
        }
    }
}

/// Summary of one eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries dropped.
    pub removed: usize,
    /// Entries left.
    pub retained: usize,
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live entries.
    pub entries: usize,
    /// Buckets created since construction.
    pub created: u64,
    /// Buckets evicted since construction.
    pub evicted: u64,
}

/// Owns every bucket. Construct once at startup and share via `Arc`.
#[derive(Debug)]
pub struct BucketRegistry {
    policies: PolicyTable,
    entries: RwLock<HashMap<RegistryKey, Entry>>,
    next_sequence: AtomicU64,
    evicted: AtomicU64,
    last_cleanup_millis: AtomicU64,
    cleanup_interval: Duration,
    high_water: usize,
    low_water: usize,
    eviction: EvictionPolicy,
    clock: Arc<dyn Clock>,
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new(PolicyTable::default())
    }
}

impl BucketRegistry {
    /// Registry with default eviction settings and a monotonic clock.
    pub fn new(policies: PolicyTable) -> Self {
        Self {
            policies,
            entries: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            last_cleanup_millis: AtomicU64::new(0),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            eviction: EvictionPolicy::default(),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Registry built from process configuration using the standard policy table.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Self::new(PolicyTable::standard(config.default_limits()?))
            .with_cleanup_interval(config.cleanup_interval())
            .with_watermarks(config.high_water, config.low_water)?
            .with_eviction(config.eviction);
        Ok(registry)
    }

    /// Override the clock (useful for deterministic tests). Restarts the cleanup interval.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.last_cleanup_millis = AtomicU64::new(clock.now_millis());
        self.clock = Arc::new(clock);
        self
    }

    /// Minimum time between eviction passes.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Trim to `low` entries once the registry exceeds `high`.
    pub fn with_watermarks(mut self, high: usize, low: usize) -> Result<Self, ConfigError> {
        if low > high {
            return Err(ConfigError::InvalidWatermarks { high, low });
        }
        self.high_water = high;
        self.low_water = low;
        Ok(self)
    }

    /// Choose which entries survive eviction.
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Policy table used for new buckets.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Existing bucket for the key, or a new full one built from the endpoint's policy.
    pub fn get_or_create(&self, client: &str, endpoint: &str) -> Arc<TokenBucket> {
        self.get_or_create_at(client, endpoint, self.clock.now_millis())
    }

    fn get_or_create_at(&self, client: &str, endpoint: &str, now_millis: u64) -> Arc<TokenBucket> {
        let key = RegistryKey::new(client, endpoint);
        if let Some(entry) = self.read().get(&key) {
            entry.touch(now_millis);
            return entry.bucket.clone();
        }

        let mut map = self.write();
        let entry = map.entry(key).or_insert_with_key(|key| {
            let limits = self.policies.limits_for(&key.endpoint);
            debug!(
                target: "tollgate::registry",
                client = %key.client,
                endpoint = %key.endpoint,
                capacity = limits.capacity(),
                refill_per_sec = limits.refill_per_sec(),
                "bucket created"
            );
            Entry {
                bucket: Arc::new(TokenBucket::new(limits, now_millis)),
                sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                last_seen_millis: AtomicU64::new(now_millis),
            }
        });
        entry.touch(now_millis);
        entry.bucket.clone()
    }

    /// Take one token from the key's bucket and describe the outcome.
    pub fn check(&self, client: &str, endpoint: &str) -> AdmissionDecision {
        let now = self.clock.now_millis();
        let bucket = self.get_or_create_at(client, endpoint, now);
        let consumption = bucket.try_consume(1, now);
        AdmissionDecision::from_consumption(bucket.limits(), consumption)
    }

    /// Run an eviction pass if the cleanup interval has elapsed.
    ///
    /// Returns `None` when the interval has not elapsed or another caller claimed
    /// the pass.
    pub fn maybe_evict(&self) -> Option<EvictionReport> {
        self.maybe_evict_at(self.clock.now_millis())
    }

    /// [`maybe_evict`](Self::maybe_evict) with an explicit reading of the registry clock.
    pub fn maybe_evict_at(&self, now_millis: u64) -> Option<EvictionReport> {
        let last = self.last_cleanup_millis.load(Ordering::Acquire);
        let interval = u64::try_from(self.cleanup_interval.as_millis()).unwrap_or(u64::MAX);
        if now_millis.saturating_sub(last) <= interval {
            return None;
        }
        self.last_cleanup_millis
            .compare_exchange(last, now_millis, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let report = self.evict();
        if report.removed > 0 {
            info!(
                target: "tollgate::registry",
                removed = report.removed,
                retained = report.retained,
                policy = ?self.eviction,
                "evicted buckets"
            );
        }
        Some(report)
    }

    fn evict(&self) -> EvictionReport {
        let mut map = self.write();
        if map.len() <= self.high_water {
            return EvictionReport { removed: 0, retained: map.len() };
        }

        let excess = map.len() - self.low_water;
        let mut ranks: Vec<(u64, u64)> = map.values().map(|e| self.eviction.rank(e)).collect();
        let (_, cutoff, _) = ranks.select_nth_unstable(excess - 1);
        let cutoff = *cutoff;
        map.retain(|_, e| self.eviction.rank(e) > cutoff);

        let retained = map.len();
        let removed = excess;
        self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
        EvictionReport { removed, retained }
    }

    /// Whether a bucket exists for the key.
    pub fn contains(&self, client: &str, endpoint: &str) -> bool {
        self.read().contains_key(&RegistryKey::new(client, endpoint))
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when no bucket exists.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Counters for inspection.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            entries: self.len(),
            created: self.next_sequence.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    // Nothing panics while these guards are held, so poisoning is recoverable.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<RegistryKey, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RegistryKey, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::BucketLimits;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    fn registry(clock: &ManualClock) -> BucketRegistry {
        BucketRegistry::new(PolicyTable::default()).with_clock(clock.clone())
    }

    #[test]
    fn same_key_returns_same_bucket() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let a = reg.get_or_create("ip:1.1.1.1", "/routes");
        let b = reg.get_or_create("ip:1.1.1.1", "/routes");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn differing_components_get_distinct_buckets() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let a = reg.get_or_create("ip:1.1.1.1", "/routes");
        let b = reg.get_or_create("ip:2.2.2.2", "/routes");
        let c = reg.get_or_create("ip:1.1.1.1", "/autocomplete");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.capacity(), 50);
        assert_eq!(reg.stats().created, 3);
    }

    #[test]
    fn racing_creators_converge_on_one_bucket() {
        let reg = Arc::new(BucketRegistry::default());
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reg.get_or_create("user:7", "/analyze-route")
                })
            })
            .collect();
        let buckets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(buckets.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.stats().created, 1);
    }

    #[test]
    fn check_reports_policy_limit() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let d = reg.check("ip:1.1.1.1", "/api/analytics");
        assert!(d.allowed);
        assert_eq!(d.limit, 30);
        assert_eq!(d.remaining, 29);
    }

    #[test]
    fn eviction_waits_for_interval() {
        let clock = ManualClock::new();
        let reg = registry(&clock).with_watermarks(10, 5).unwrap();
        for i in 0..20 {
            reg.get_or_create(&format!("ip:{i}"), "/routes");
        }
        assert_eq!(reg.maybe_evict(), None);
        clock.advance(Duration::from_secs(300));
        assert_eq!(reg.maybe_evict(), None, "interval must be strictly exceeded");
        clock.advance(Duration::from_millis(1));
        assert_eq!(reg.maybe_evict(), Some(EvictionReport { removed: 15, retained: 5 }));
        assert_eq!(reg.maybe_evict(), None, "timestamp recorded");
    }

    #[test]
    fn pass_below_high_water_keeps_everything() {
        let clock = ManualClock::new();
        let reg = registry(&clock).with_watermarks(10, 5).unwrap();
        for i in 0..10 {
            reg.get_or_create(&format!("ip:{i}"), "/routes");
        }
        clock.advance(Duration::from_secs(301));
        assert_eq!(reg.maybe_evict(), Some(EvictionReport { removed: 0, retained: 10 }));
        assert_eq!(reg.len(), 10);
    }

    #[test]
    fn insertion_order_keeps_newest_even_if_old_is_busy() {
        let clock = ManualClock::new();
        let reg = registry(&clock).with_watermarks(4, 2).unwrap();
        for i in 0..5 {
            reg.get_or_create(&format!("ip:{i}"), "/routes");
        }
        clock.advance(Duration::from_secs(301));
        reg.get_or_create("ip:0", "/routes");
        reg.maybe_evict().unwrap();
        assert!(!reg.contains("ip:0", "/routes"));
        assert!(reg.contains("ip:3", "/routes"));
        assert!(reg.contains("ip:4", "/routes"));
        assert_eq!(reg.stats().evicted, 3);
    }

    #[test]
    fn lru_keeps_recently_used() {
        let clock = ManualClock::new();
        let reg = registry(&clock)
            .with_watermarks(4, 2)
            .unwrap()
            .with_eviction(EvictionPolicy::LeastRecentlyUsed);
        for i in 0..5 {
            reg.get_or_create(&format!("ip:{i}"), "/routes");
            clock.advance(Duration::from_millis(10));
        }
        clock.advance(Duration::from_secs(301));
        reg.get_or_create("ip:0", "/routes");
        reg.maybe_evict().unwrap();
        assert!(reg.contains("ip:0", "/routes"));
        assert!(reg.contains("ip:4", "/routes"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn surviving_buckets_keep_their_level() {
        let clock = ManualClock::new();
        let reg = BucketRegistry::new(PolicyTable::uniform(BucketLimits::new(5, 0.0).unwrap()))
            .with_clock(clock.clone())
            .with_watermarks(4, 2)
            .unwrap();
        for i in 0..5 {
            reg.get_or_create(&format!("ip:{i}"), "/x");
        }
        for expected in [4, 3, 2] {
            assert_eq!(reg.check("ip:4", "/x").remaining, expected);
        }
        clock.advance(Duration::from_secs(301));

        assert_eq!(reg.maybe_evict(), Some(EvictionReport { removed: 3, retained: 2 }));
        assert!(reg.contains("ip:4", "/x"));
        let d = reg.check("ip:4", "/x");
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
        assert_eq!(reg.stats().created, 5);
    }

    #[test]
    fn evicted_client_gets_fresh_bucket() {
        let clock = ManualClock::new();
        let reg = BucketRegistry::new(PolicyTable::uniform(BucketLimits::new(2, 0.0).unwrap()))
            .with_clock(clock.clone())
            .with_watermarks(1, 0)
            .unwrap();
        let held = reg.get_or_create("ip:a", "/x");
        assert!(reg.check("ip:a", "/x").allowed);
        assert!(reg.check("ip:a", "/x").allowed);
        assert!(!reg.check("ip:a", "/x").allowed);
        reg.get_or_create("ip:b", "/x");
        clock.advance(Duration::from_secs(301));
        reg.maybe_evict().unwrap();
        assert!(reg.is_empty());

        // The held handle still works but is no longer reachable.
        assert!(!held.try_consume(1, clock.now_millis()).allowed);
        let d = reg.check("ip:a", "/x");
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[test]
    fn inverted_watermarks_rejected() {
        let err = BucketRegistry::default().with_watermarks(10, 20).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWatermarks { high: 10, low: 20 }));
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn eviction_pass_is_logged() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::new();
        let reg = registry(&clock).with_watermarks(2, 1).unwrap();
        for i in 0..3 {
            reg.get_or_create(&format!("ip:{i}"), "/routes");
        }
        clock.advance(Duration::from_secs(301));
        reg.maybe_evict().unwrap();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("evicted buckets"), "missing eviction log: {logs}");
        assert!(logs.contains("tollgate::registry"));
    }
}

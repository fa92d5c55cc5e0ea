mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http::StatusCode;
use tollgate::{AdmissionLayer, BucketLimits, BucketRegistry, ManualClock, PolicyTable};
use tower::{Layer, ServiceExt};

use common::test_helpers::{request_as_user, uniform_registry, CountingSvc};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_requests_never_exceed_capacity() {
    let clock = ManualClock::new();
    let inner = CountingSvc::default();
    let svc = AdmissionLayer::new(uniform_registry(&clock, 25, 0.0)).layer(inner.clone());

    let mut handles = vec![];
    for _ in 0..200 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            svc.oneshot(request_as_user("/routes", "hot")).await.unwrap().status()
        }));
    }

    let statuses: Vec<StatusCode> =
        futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
    let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let rejected = statuses.iter().filter(|s| **s == StatusCode::TOO_MANY_REQUESTS).count();

    assert_eq!(admitted, 25);
    assert_eq!(rejected, 175);
    assert_eq!(inner.calls(), 25);
}

#[test]
fn threads_racing_on_a_fresh_key_share_one_bucket() {
    let table = PolicyTable::uniform(BucketLimits::new(10, 0.0).unwrap());
    let registry = Arc::new(BucketRegistry::new(table).with_clock(ManualClock::new()));
    let barrier = Arc::new(std::sync::Barrier::new(16));
    let admitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let admitted = admitted.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..5 {
                    if registry.check("ip:198.51.100.7", "/autocomplete").allowed {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 10);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.stats().created, 1);
}

#[test]
fn eviction_pass_is_claimed_once() {
    let clock = ManualClock::new();
    let registry = Arc::new(
        BucketRegistry::new(PolicyTable::default())
            .with_clock(clock.clone())
            .with_watermarks(10, 5)
            .unwrap(),
    );
    for i in 0..50 {
        registry.get_or_create(&format!("ip:{i}"), "/routes");
    }
    clock.advance(std::time::Duration::from_secs(301));

    let barrier = Arc::new(std::sync::Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                registry.maybe_evict()
            })
        })
        .collect();
    let passes = handles.into_iter().filter_map(|h| h.join().unwrap()).count();

    assert_eq!(passes, 1);
    assert_eq!(registry.len(), 5);
    assert_eq!(registry.stats().evicted, 45);
}

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tollgate::{
    AuthenticatedPrincipal, BucketLimits, BucketRegistry, ManualClock, PeerAddr, PolicyTable,
};
use tower::Service;

/// Inner service that counts calls and answers 200 "ok".
#[derive(Clone, Default)]
pub struct CountingSvc {
    pub calls: Arc<AtomicUsize>,
}

impl CountingSvc {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Service<Request<String>> for CountingSvc {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<String>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(Response::new(String::from("ok"))))
    }
}

pub fn request(path: &str) -> Request<String> {
    Request::builder().uri(path).body(String::new()).unwrap()
}

pub fn request_from_ip(path: &str, ip: &str) -> Request<String> {
    let mut req = request(path);
    req.extensions_mut().insert(PeerAddr(format!("{ip}:40000").parse().unwrap()));
    req
}

pub fn request_as_user(path: &str, user: &str) -> Request<String> {
    let mut req = request(path);
    req.extensions_mut().insert(AuthenticatedPrincipal(user.to_string()));
    req
}

pub fn header(resp: &Response<String>, name: &str) -> u64 {
    resp.headers()[name].to_str().unwrap().parse().unwrap()
}

/// Registry using the shipped policy table and a hand-driven clock.
pub fn standard_registry(clock: &ManualClock) -> Arc<BucketRegistry> {
    Arc::new(BucketRegistry::new(PolicyTable::default()).with_clock(clock.clone()))
}

/// Registry where every endpoint shares the same limits.
pub fn uniform_registry(clock: &ManualClock, capacity: u32, refill: f64) -> Arc<BucketRegistry> {
    let table = PolicyTable::uniform(BucketLimits::new(capacity, refill).unwrap());
    Arc::new(BucketRegistry::new(table).with_clock(clock.clone()))
}

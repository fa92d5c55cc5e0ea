//! Admission decisions and the HTTP surface they produce.

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Response, StatusCode};
use serde::Serialize;

use crate::policy::BucketLimits;
use crate::token_bucket::Consumption;

/// Header carrying the bucket capacity.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the whole tokens left after this request.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Header carrying the reset estimate in seconds.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Reset hint for a throttled request when the bucket never refills.
pub const NO_REFILL_RETRY_SECS: u64 = 60;

/// Allow/deny outcome plus quota telemetry for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Whole tokens left; always 0 when denied.
    pub remaining: u32,
    /// Bucket capacity.
    pub limit: u32,
    /// Seconds until the bucket is full again (allowed) or until a token is available (denied).
    pub reset_secs: u64,
}

impl AdmissionDecision {
    /// Derive the decision from a bucket's consumption result.
    pub fn from_consumption(limits: BucketLimits, consumption: Consumption) -> Self {
        let limit = limits.capacity();
        let rate = limits.refill_per_sec();
        let level = consumption.remaining.max(0.0);
        if consumption.allowed {
            let remaining = (level.floor() as u32).min(limit);
            let reset_secs = if rate > 0.0 {
                (f64::from(limit - remaining) / rate).floor() as u64
            } else {
                0
            };
            Self { allowed: true, remaining, limit, reset_secs }
        } else {
            let reset_secs = if rate > 0.0 {
                ((1.0 - level) / rate).ceil().max(0.0) as u64
            } else {
                NO_REFILL_RETRY_SECS
            };
            Self { allowed: false, remaining: 0, limit, reset_secs }
        }
    }

    /// Write the three quota headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_secs));
    }

    /// JSON body sent with a 429.
    pub fn rejection_body(&self) -> RejectionBody {
        RejectionBody {
            error: "Rate limit exceeded",
            message: format!(
                "Too many requests. Please try again in {} seconds.",
                self.reset_secs
            ),
            retry_after: self.reset_secs,
        }
    }

    /// Build the 429 response: quota headers, `Retry-After` and the JSON body.
    pub fn into_rejection<B>(self) -> Response<B>
    where
        B: From<String>,
    {
        let body = serde_json::to_string(&self.rejection_body())
            .unwrap_or_else(|_| String::from(r#"{"error":"Rate limit exceeded"}"#));
        let mut response = Response::new(B::from(body));
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        let headers = response.headers_mut();
        self.apply_headers(headers);
        headers.insert(RETRY_AFTER, HeaderValue::from(self.reset_secs));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Structured body of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    /// Fixed cause.
    pub error: &'static str,
    /// Human-readable retry hint.
    pub message: String,
    /// Seconds to wait before retrying.
    pub retry_after: u64,
}

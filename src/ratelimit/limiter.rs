//! Limiter trait for abstracting over the limiting algorithms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};

use crate::context::Context;
use crate::error::Result;

/// Header carrying the configured limit.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Header carrying the remaining quota.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Header carrying the unix time at which the quota resets.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// Outcome of a single `allow` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the unit of work may proceed
    pub allowed: bool,
    /// The configured limit (window limit or bucket burst)
    pub limit: u64,
    /// Quota left after this call, never above `limit`
    pub remaining: u64,
    /// Time until more quota becomes available
    #[serde(rename = "reset_after_ms", serialize_with = "serialize_millis")]
    pub reset_after: Duration,
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

impl RateLimitResult {
    /// Response headers describing this result, with the reset time computed
    /// from the current wall clock.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.headers_at(Utc::now())
    }

    /// Response headers describing this result, as seen at `now`.
    pub fn headers_at(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let reset_at = TimeDelta::from_std(self.reset_after)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now);

        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, reset_at.timestamp().to_string()),
        ]
    }
}

/// A rate limiting algorithm.
///
/// Implementations hold no per-key state themselves; every call is a single
/// operation against a [`Store`](crate::store::Store).
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Count one unit of work for `key` and decide whether it may proceed.
    ///
    /// A denial is reported through [`RateLimitResult::allowed`], never as
    /// an error. Errors are store failures and cancellation.
    async fn allow(&self, ctx: &Context, key: &str) -> Result<RateLimitResult>;
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    async fn allow(&self, ctx: &Context, key: &str) -> Result<RateLimitResult> {
        (**self).allow(ctx, key).await
    }
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for Box<L> {
    async fn allow(&self, ctx: &Context, key: &str) -> Result<RateLimitResult> {
        (**self).allow(ctx, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_headers_at() {
        let result = RateLimitResult {
            allowed: true,
            limit: 100,
            remaining: 42,
            reset_after: Duration::from_millis(30_500),
        };
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let headers = result.headers_at(now);
        assert_eq!(
            headers,
            vec![
                (HEADER_LIMIT, "100".to_string()),
                (HEADER_REMAINING, "42".to_string()),
                (HEADER_RESET, "1700000030".to_string()),
            ]
        );
    }

    #[test]
    fn test_serializes_reset_as_millis() {
        let result = RateLimitResult {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_after: Duration::from_millis(1250),
        };
        let json = serde_json::to_value(result).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["reset_after_ms"], 1250);
    }
}

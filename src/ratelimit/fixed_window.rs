//! Fixed window limiter: counts requests per discrete time bucket.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::limiter::{Limiter, RateLimitResult};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::{Store, WindowCount};

/// Allows at most `limit` requests per key in each window.
///
/// The first request for a key anchors its window; the window never slides.
#[derive(Debug)]
pub struct FixedWindowLimiter<S> {
    store: S,
    limit: u64,
    window: Duration,
}

impl<S: Store> FixedWindowLimiter<S> {
    /// Create a limiter allowing `limit` requests per `window`.
    ///
    /// A `limit` of zero denies everything. The window must be non-zero.
    pub fn new(store: S, limit: u64, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(Error::InvalidWindow);
        }
        Ok(Self {
            store,
            limit,
            window,
        })
    }

    /// Get the limit for this limiter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the window for this limiter.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[async_trait]
impl<S: Store> Limiter for FixedWindowLimiter<S> {
    async fn allow(&self, ctx: &Context, key: &str) -> Result<RateLimitResult> {
        let WindowCount { count, reset_after } =
            self.store.increment(ctx, key, self.window).await?;

        let allowed = count <= self.limit;
        let result = RateLimitResult {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            reset_after: reset_after.min(self.window),
        };

        if allowed {
            trace!(key = %key, count, remaining = result.remaining, "Fixed window allowed");
        } else {
            debug!(key = %key, count, limit = self.limit, "Fixed window limit exceeded");
        }

        Ok(result)
    }
}

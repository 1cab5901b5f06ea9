//! Token bucket limiter: continuous refill with bursts.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::limiter::{Limiter, RateLimitResult};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::{Store, TokenTake};

/// Allows bursts of up to `burst` requests per key, refilled continuously at
/// `rate` tokens per second.
#[derive(Debug)]
pub struct TokenBucketLimiter<S> {
    store: S,
    rate: f64,
    burst: u64,
}

impl<S: Store> TokenBucketLimiter<S> {
    /// Create a limiter refilling `rate` tokens per second up to `burst`.
    ///
    /// `rate` must be finite and positive and `burst` at least one.
    pub fn new(store: S, rate: f64, burst: u64) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::InvalidRate { rate });
        }
        if burst == 0 {
            return Err(Error::InvalidBurst { burst });
        }
        Ok(Self { store, rate, burst })
    }

    /// Get the refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Get the bucket capacity.
    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Time until the next whole token accrues above `tokens`, or zero when
    /// the bucket is already full.
    fn next_token_after(&self, tokens: f64) -> Duration {
        if tokens >= self.burst as f64 {
            return Duration::ZERO;
        }
        let missing = tokens.floor() + 1.0 - tokens;
        Duration::try_from_secs_f64(missing / self.rate).unwrap_or(Duration::MAX)
    }
}

#[async_trait]
impl<S: Store> Limiter for TokenBucketLimiter<S> {
    async fn allow(&self, ctx: &Context, key: &str) -> Result<RateLimitResult> {
        let TokenTake { allowed, remaining } =
            self.store.take_token(ctx, key, self.rate, self.burst).await?;

        let tokens = remaining.clamp(0.0, self.burst as f64);
        let result = RateLimitResult {
            allowed,
            limit: self.burst,
            // fractional tokens are reported truncated
            remaining: tokens.trunc() as u64,
            reset_after: self.next_token_after(tokens),
        };

        if allowed {
            trace!(key = %key, tokens, "Token bucket allowed");
        } else {
            debug!(
                key = %key,
                tokens,
                retry_after_ms = result.reset_after.as_millis() as u64,
                "Token bucket empty"
            );
        }

        Ok(result)
    }
}

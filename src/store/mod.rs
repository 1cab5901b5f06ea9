//! Keyed rate-state backends.
//!
//! A [`Store`] exposes exactly two atomic operations. Both limiter
//! algorithms are written against this trait, so the same limiter behaves
//! identically over the in-process [`MemoryStore`] and the shared
//! [`RedisStore`].

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Outcome of a fixed window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after this increment.
    pub count: u64,
    /// Time left until the window anchored by the first increment expires.
    pub reset_after: Duration,
}

/// Outcome of a token bucket take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenTake {
    /// Whether a token was deducted.
    pub allowed: bool,
    /// Tokens left in the bucket after refill and deduction.
    pub remaining: f64,
}

/// Atomic keyed state shared by the limiter algorithms.
///
/// Implementations must serialize the read-modify-write cycle of every call
/// on the same key. Calls on different keys are independent.
#[async_trait]
pub trait Store: Send + Sync {
    /// Increment the fixed window counter for `key`.
    ///
    /// The first increment of a fresh key anchors its expiry at
    /// `now + window`; later increments never extend it.
    async fn increment(
        &self,
        ctx: &Context,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError>;

    /// Refill the bucket for `key` at `rate` tokens per second up to `burst`
    /// and take one token if at least one is available.
    async fn take_token(
        &self,
        ctx: &Context,
        key: &str,
        rate: f64,
        burst: u64,
    ) -> Result<TokenTake, StoreError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn increment(
        &self,
        ctx: &Context,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        (**self).increment(ctx, key, window).await
    }

    async fn take_token(
        &self,
        ctx: &Context,
        key: &str,
        rate: f64,
        burst: u64,
    ) -> Result<TokenTake, StoreError> {
        (**self).take_token(ctx, key, rate, burst).await
    }
}

//! Framework-independent admission check for request middleware.
//!
//! A [`Gate`] does everything an HTTP adapter needs apart from touching the
//! framework's own types: it derives a key from the request, asks the
//! limiter, logs the decision, computes the rate limit headers and invokes
//! the error handler on denial. Adapters only translate the returned
//! [`Decision`] into a response.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ratelimit::{Limiter, RateLimitResult};

/// Derives the rate limit key from a request.
pub type KeyFn<R> = Arc<dyn Fn(&R) -> Result<String> + Send + Sync>;

/// Called with the denied request, [`Error::LimitExceeded`] and the result.
pub type ErrorHandler<R> = Arc<dyn Fn(&R, &Error, &RateLimitResult) + Send + Sync>;

/// Options shared by every adapter.
pub struct GateOptions<R> {
    /// Key extraction; the default fails every request.
    pub key_fn: KeyFn<R>,
    /// Denial hook; the default only logs.
    pub error_handler: ErrorHandler<R>,
}

impl<R: 'static> Default for GateOptions<R> {
    fn default() -> Self {
        Self {
            key_fn: Arc::new(|_: &R| Err(Error::KeyExtraction("no key extractor configured".into()))),
            error_handler: Arc::new(|_: &R, err: &Error, result: &RateLimitResult| {
                debug!(error = %err, limit = result.limit, "Request rejected");
            }),
        }
    }
}

impl<R> Clone for GateOptions<R> {
    fn clone(&self) -> Self {
        Self {
            key_fn: self.key_fn.clone(),
            error_handler: self.error_handler.clone(),
        }
    }
}

impl<R> fmt::Debug for GateOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateOptions").finish_non_exhaustive()
    }
}

impl<R> GateOptions<R> {
    /// Use `f` to derive keys.
    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> Result<String> + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(f);
        self
    }

    /// Call `f` for every denied request.
    pub fn with_error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&R, &Error, &RateLimitResult) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(f);
        self
    }
}

/// What an adapter should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The limiter's verdict.
    pub result: RateLimitResult,
    /// `X-RateLimit-*` headers to attach to the response.
    pub headers: Vec<(&'static str, String)>,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn allowed(&self) -> bool {
        self.result.allowed
    }
}

/// Limiter plus adapter options.
pub struct Gate<L, R> {
    limiter: L,
    options: GateOptions<R>,
}

impl<L: Limiter, R> Gate<L, R> {
    /// Create a gate over `limiter`.
    pub fn new(limiter: L, options: GateOptions<R>) -> Self {
        Self { limiter, options }
    }

    /// Get the wrapped limiter.
    pub fn limiter(&self) -> &L {
        &self.limiter
    }

    /// Check one request.
    ///
    /// Key extraction and limiter failures are returned as errors so the
    /// adapter can pick fail-open or fail-closed. A denial is not an error.
    pub async fn check(&self, ctx: &Context, request: &R) -> Result<Decision> {
        let key = (self.options.key_fn)(request).map_err(|e| {
            error!(error = %e, "Failed to extract rate limit key");
            e
        })?;

        let result = self.limiter.allow(ctx, &key).await.map_err(|e| {
            error!(key = %key, error = %e, "Limiter failed");
            e
        })?;

        if result.allowed {
            debug!(
                key = %key,
                remaining = result.remaining,
                limit = result.limit,
                "Request allowed"
            );
        } else {
            debug!(
                key = %key,
                remaining = result.remaining,
                limit = result.limit,
                "Request denied"
            );
            (self.options.error_handler)(request, &Error::LimitExceeded, &result);
        }

        Ok(Decision {
            headers: result.headers(),
            result,
        })
    }
}

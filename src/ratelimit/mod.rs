//! Rate limiting algorithms.

mod fixed_window;
mod limiter;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use limiter::{Limiter, RateLimitResult, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET};
pub use token_bucket::TokenBucketLimiter;

//! Error types for Ratekeeper.

use thiserror::Error;

/// Errors raised by a [`Store`](crate::store::Store) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or did not answer in time.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The calling context was canceled or its deadline passed.
    #[error("Operation canceled")]
    Canceled,

    /// The backend answered with something other than the expected shape.
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            // the server answered, just not with what the call needs
            redis::ErrorKind::TypeError
            | redis::ErrorKind::ResponseError
            | redis::ErrorKind::ExtensionError
            | redis::ErrorKind::ParseError => StoreError::InvalidResponse(err.to_string()),
            _ => StoreError::BackendUnavailable(err.to_string()),
        }
    }
}

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store errors, propagated unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Token bucket refill rate is not finite and positive
    #[error("Invalid refill rate: {rate}. Rate must be finite and positive.")]
    InvalidRate {
        /// The rejected rate.
        rate: f64,
    },

    /// Token bucket burst is zero
    #[error("Invalid burst size: {burst}. Burst must be greater than zero.")]
    InvalidBurst {
        /// The rejected burst.
        burst: u64,
    },

    /// Fixed window duration is zero
    #[error("Invalid window: window must be longer than zero")]
    InvalidWindow,

    /// No key could be derived from a request
    #[error("Key extraction failed: {0}")]
    KeyExtraction(String),

    /// The request was denied by the limiter
    #[error("Rate limit exceeded")]
    LimitExceeded,
}

impl Error {
    /// Whether this error came from the calling context being canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Store(StoreError::Canceled))
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_transparently() {
        let err: Error = StoreError::Canceled.into();
        assert!(err.is_canceled());
        assert_eq!(err.to_string(), "Operation canceled");
    }

    #[test]
    fn test_redis_type_error_is_invalid_response() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        assert!(matches!(
            StoreError::from(redis_err),
            StoreError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_redis_error_replies_are_invalid_response() {
        let cases = vec![
            (redis::ErrorKind::ResponseError, "Error running script"),
            (
                redis::ErrorKind::ExtensionError,
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            ),
        ];
        for case in cases {
            assert!(matches!(
                StoreError::from(redis::RedisError::from(case)),
                StoreError::InvalidResponse(_)
            ));
        }
    }

    #[test]
    fn test_redis_busy_loading_is_backend_unavailable() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::BusyLoadingError, "loading"));
        assert!(matches!(
            StoreError::from(redis_err),
            StoreError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn test_redis_io_error_is_backend_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let redis_err = redis::RedisError::from(io);
        assert!(matches!(
            StoreError::from(redis_err),
            StoreError::BackendUnavailable(_)
        ));
    }
}

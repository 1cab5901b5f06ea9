//! Configuration management for Ratekeeper.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ratelimit::{FixedWindowLimiter, Limiter, TokenBucketLimiter};
use crate::store::{MemoryStore, RedisStore, Store};

/// Prefix of environment variables overriding file settings, e.g.
/// `RATEKEEPER__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Which backend holds rate state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process maps, single instance only
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: StoreBackend,

    /// Expiry sweep interval for the memory backend in milliseconds; zero
    /// disables sweeping
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix added to every Redis key
    #[serde(default)]
    pub key_prefix: String,

    /// Per-call Redis timeout in milliseconds
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sweep_interval_ms: default_sweep_interval(),
            redis_url: default_redis_url(),
            key_prefix: String::new(),
            command_timeout_ms: None,
        }
    }
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Limiting algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Discrete windows of `window_ms` allowing `limit` requests each
    #[default]
    FixedWindow,
    /// Bucket of `burst` tokens refilled at `rate` per second
    TokenBucket,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Algorithm to use
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Requests allowed per window (fixed window)
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds (fixed window)
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Tokens added per second (token bucket)
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket capacity (token bucket)
    #[serde(default = "default_burst")]
    pub burst: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            limit: default_limit(),
            window_ms: default_window(),
            rate: default_rate(),
            burst: default_burst(),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> u64 {
    60_000
}

fn default_rate() -> f64 {
    10.0
}

fn default_burst() -> u64 {
    20
}

impl RatekeeperConfig {
    /// Load configuration from a file, with `RATEKEEPER__*` environment
    /// variables taking precedence.
    ///
    /// The format follows the file extension (YAML, TOML, JSON).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: RatekeeperConfig = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings the selected store and algorithm depend on.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.limiter.validate()
    }
}

impl StoreConfig {
    /// Get the sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Get the Redis command timeout, if any.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::Redis && self.redis_url.trim().is_empty() {
            return Err(Error::Config("redis_url is required for the redis backend".into()));
        }
        if self.command_timeout_ms == Some(0) {
            return Err(Error::Config("command_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Build the configured store.
    ///
    /// The memory backend's sweep runs until `ctx` is done.
    pub async fn build(&self, ctx: &Context) -> Result<Arc<dyn Store>> {
        self.validate()?;

        match self.backend {
            StoreBackend::Memory => {
                info!(
                    sweep_interval_ms = self.sweep_interval_ms,
                    "Using in-process store"
                );
                Ok(Arc::new(MemoryStore::with_sweeper(ctx, self.sweep_interval())))
            }
            StoreBackend::Redis => {
                let mut store =
                    RedisStore::connect(&self.redis_url).await?.with_key_prefix(&self.key_prefix);
                if let Some(timeout) = self.command_timeout() {
                    store = store.with_command_timeout(timeout);
                }
                info!(key_prefix = %self.key_prefix, "Using Redis store");
                Ok(Arc::new(store))
            }
        }
    }
}

impl LimiterConfig {
    /// Get the fixed window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::FixedWindow if self.window_ms == 0 => Err(Error::InvalidWindow),
            Algorithm::TokenBucket if !self.rate.is_finite() || self.rate <= 0.0 => {
                Err(Error::InvalidRate { rate: self.rate })
            }
            Algorithm::TokenBucket if self.burst == 0 => Err(Error::InvalidBurst { burst: 0 }),
            _ => Ok(()),
        }
    }

    /// Build the configured limiter over `store`.
    pub fn build<S: Store + 'static>(&self, store: S) -> Result<Box<dyn Limiter>> {
        match self.algorithm {
            Algorithm::FixedWindow => {
                info!(limit = self.limit, window_ms = self.window_ms, "Using fixed window limiter");
                Ok(Box::new(FixedWindowLimiter::new(store, self.limit, self.window())?))
            }
            Algorithm::TokenBucket => {
                info!(rate = self.rate, burst = self.burst, "Using token bucket limiter");
                Ok(Box::new(TokenBucketLimiter::new(store, self.rate, self.burst)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RatekeeperConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.limiter.algorithm, Algorithm::FixedWindow);
        assert_eq!(config.limiter.limit, 100);
        assert_eq!(config.limiter.window(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
store:
  backend: redis
  key_prefix: "rl:"
  command_timeout_ms: 250
limiter:
  algorithm: token_bucket
  rate: 2.5
  burst: 5
"#;
        let config = RatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "rl:");
        assert_eq!(config.store.command_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.store.sweep_interval_ms, 60_000);
        assert_eq!(config.limiter.algorithm, Algorithm::TokenBucket);
        assert_eq!(config.limiter.rate, 2.5);
        assert_eq!(config.limiter.burst, 5);
        assert_eq!(config.limiter.limit, 100);
    }

    #[test]
    fn test_validation_errors() {
        let err = RatekeeperConfig::from_yaml("limiter:\n  window_ms: 0\n").unwrap_err();
        assert!(matches!(err, Error::InvalidWindow));

        let err = RatekeeperConfig::from_yaml(
            "limiter:\n  algorithm: token_bucket\n  rate: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRate { .. }));

        let err = RatekeeperConfig::from_yaml(
            "limiter:\n  algorithm: token_bucket\n  burst: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidBurst { burst: 0 }));

        let err =
            RatekeeperConfig::from_yaml("store:\n  backend: redis\n  redis_url: \"\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_window_ignored_for_token_bucket() {
        let yaml = "limiter:\n  algorithm: token_bucket\n  window_ms: 0\n";
        assert!(RatekeeperConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = RatekeeperConfig::from_yaml("store:\n  backend: etcd\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("ratekeeper-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "limiter:\n  algorithm: fixed_window\n  limit: 7\n  window_ms: 1000\n",
        )
        .unwrap();

        let config = RatekeeperConfig::from_file(&path).unwrap();
        assert_eq!(config.limiter.limit, 7);
        assert_eq!(config.limiter.window_ms, 1000);

        std::env::set_var("RATEKEEPER__LIMITER__LIMIT", "11");
        let config = RatekeeperConfig::from_file(&path);
        std::env::remove_var("RATEKEEPER__LIMITER__LIMIT");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.unwrap().limiter.limit, 11);
    }

    #[test]
    fn test_from_missing_file() {
        let err = RatekeeperConfig::from_file("/nonexistent/ratekeeper.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_build_memory_fixed_window() {
        let ctx = Context::background();
        let config = RatekeeperConfig::from_yaml(
            "store:\n  sweep_interval_ms: 0\nlimiter:\n  limit: 2\n  window_ms: 5000\n",
        )
        .unwrap();

        let store = config.store.build(&ctx).await.unwrap();
        let limiter = config.limiter.build(store).unwrap();

        assert!(limiter.allow(&ctx, "k").await.unwrap().allowed);
        assert!(limiter.allow(&ctx, "k").await.unwrap().allowed);
        assert!(!limiter.allow(&ctx, "k").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_build_memory_token_bucket() {
        let ctx = Context::background();
        let config = RatekeeperConfig::from_yaml(
            "limiter:\n  algorithm: token_bucket\n  rate: 1\n  burst: 1\n",
        )
        .unwrap();

        let store = config.store.build(&ctx).await.unwrap();
        let limiter = config.limiter.build(store).unwrap();

        let res = limiter.allow(&ctx, "k").await.unwrap();
        assert!(res.allowed);
        assert_eq!(res.limit, 1);
        assert!(!limiter.allow(&ctx, "k").await.unwrap().allowed);
    }
}

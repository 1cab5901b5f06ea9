//! Redis-backed store shared by every limiter instance pointing at the same
//! server.
//!
//! Each operation is a single Lua script invocation, so the read, compute and
//! write steps run as one indivisible unit on the server. The client holds no
//! mutable state beyond its connection handle.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{Script, Value};
use tracing::{debug, info, trace, warn};

use super::{Store, TokenTake, WindowCount};
use crate::context::Context;
use crate::error::StoreError;

/// Appended to a key when its fixed window counter has to live beside a
/// token bucket hash.
const FIXED_WINDOW_SIDE_SUFFIX: &str = ":fixed_window";
/// Appended to a key when its token bucket hash has to live beside a fixed
/// window counter.
const TOKEN_BUCKET_SIDE_SUFFIX: &str = ":token_bucket";

/// Fixed window increment. KEYS is the key and its side key, ARGV[1] the
/// window in milliseconds.
///
/// The counter moves to the side key only while the key holds something
/// other than a string. Returns `{count, pttl}`.
const INCREMENT_LUA: &str = r#"
local key = KEYS[1]
local kind = redis.call("TYPE", KEYS[1]).ok
if redis.call("EXISTS", KEYS[2]) == 1 or (kind ~= "none" and kind ~= "string") then
    key = KEYS[2]
end

local count = redis.call("INCR", key)
if count == 1 then
    redis.call("PEXPIRE", key, ARGV[1])
end
return {count, redis.call("PTTL", key)}
"#;

/// Token bucket take. KEYS is the key and its side key, ARGV is `rate`,
/// `burst`, `now` (unix seconds), all as decimal text.
///
/// Persists `tokens` and `last_updated` in a hash, on the side key only while
/// the key holds something other than a hash. Returns
/// `{allowed, tostring(tokens)}`.
const TAKE_TOKEN_LUA: &str = r#"
local key = KEYS[1]
local kind = redis.call("TYPE", KEYS[1]).ok
if redis.call("EXISTS", KEYS[2]) == 1 or (kind ~= "none" and kind ~= "hash") then
    key = KEYS[2]
end

local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local state = redis.call("HMGET", key, "tokens", "last_updated")
local tokens = tonumber(state[1])
local last_updated = tonumber(state[2])
local allowed = 0

if tokens == nil or last_updated == nil then
    tokens = burst - 1
    last_updated = now
    allowed = 1
else
    local elapsed = now - last_updated
    if elapsed > 0 then
        tokens = tokens + elapsed * rate
        if tokens > burst then
            tokens = burst
        end
    end
    if tokens >= 1 then
        tokens = tokens - 1
        allowed = 1
    end
end

redis.call("HSET", key, "tokens", tokens, "last_updated", now)
local ttl = math.ceil((burst / rate) * 2)
if ttl < 10 then
    ttl = 10
end
redis.call("EXPIRE", key, ttl)

return {allowed, tostring(tokens)}
"#;

/// Store keeping rate state in Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    increment_script: Script,
    take_token_script: Script,
    key_prefix: String,
    command_timeout: Option<Duration>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Open a multiplexed connection to `url` and build a store on it.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!(url = %url, "Connecting to Redis");
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Redis connection established");
        Ok(Self::new(conn))
    }

    /// Build a store on an existing connection.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            increment_script: Script::new(INCREMENT_LUA),
            take_token_script: Script::new(TAKE_TOKEN_LUA),
            key_prefix: String::new(),
            command_timeout: None,
        }
    }

    /// Prepend `prefix` to every key sent to Redis.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Fail calls that take longer than `timeout` with
    /// [`StoreError::BackendUnavailable`].
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    fn redis_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
        if self.key_prefix.is_empty() {
            Cow::Borrowed(key)
        } else {
            Cow::Owned(format!("{}{}", self.key_prefix, key))
        }
    }

    /// Run one round trip under the caller's context and the command timeout.
    async fn round_trip<F>(&self, ctx: &Context, call: F) -> Result<Value, StoreError>
    where
        F: Future<Output = Result<Value, StoreError>>,
    {
        let res = match self.command_timeout {
            Some(limit) => {
                ctx.run(async move {
                    tokio::time::timeout(limit, call).await.map_err(|_| {
                        StoreError::BackendUnavailable(format!(
                            "command timed out after {}ms",
                            limit.as_millis()
                        ))
                    })?
                })
                .await
            }
            None => ctx.run(call).await,
        };

        if let Err(ref e) = res {
            warn!(error = %e, "Redis store call failed");
        }
        res
    }
}

/// Current wall clock time in unix seconds.
fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9
}

fn invalid(what: &str, reply: &Value) -> StoreError {
    StoreError::InvalidResponse(format!("{what}: {reply:?}"))
}

fn parse_window_count(reply: Value, window: Duration) -> Result<WindowCount, StoreError> {
    let Value::Array(ref items) = reply else {
        return Err(invalid("increment reply is not an array", &reply));
    };

    match items.as_slice() {
        [Value::Int(count), Value::Int(pttl)] if *count >= 1 => {
            // PTTL is negative when the key carries no expiry
            let reset_after = match u64::try_from(*pttl) {
                Ok(ms) => Duration::from_millis(ms).min(window),
                Err(_) => {
                    debug!(pttl = *pttl, "Counter has no expiry, reporting full window");
                    window
                }
            };
            Ok(WindowCount {
                count: *count as u64,
                reset_after,
            })
        }
        _ => Err(invalid("unexpected increment reply", &reply)),
    }
}

fn parse_token_take(reply: Value) -> Result<TokenTake, StoreError> {
    let Value::Array(ref items) = reply else {
        return Err(invalid("take_token reply is not an array", &reply));
    };

    let (allowed, text) = match items.as_slice() {
        [Value::Int(allowed @ (0 | 1)), Value::BulkString(bytes)] => (
            *allowed == 1,
            std::str::from_utf8(bytes).map_err(|_| invalid("token count is not UTF-8", &reply))?,
        ),
        [Value::Int(allowed @ (0 | 1)), Value::SimpleString(text)] => (*allowed == 1, text.as_str()),
        _ => return Err(invalid("unexpected take_token reply", &reply)),
    };

    let remaining: f64 = text
        .parse()
        .map_err(|_| invalid("token count is not a decimal number", &reply))?;
    if !remaining.is_finite() || remaining < 0.0 {
        return Err(invalid("token count out of range", &reply));
    }

    Ok(TokenTake { allowed, remaining })
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(
        &self,
        ctx: &Context,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let redis_key = self.redis_key(key);
        let side_key = format!("{redis_key}{FIXED_WINDOW_SIDE_SUFFIX}");
        // PEXPIRE 0 would delete the counter outright
        let window_ms = window.as_millis().max(1) as u64;
        let mut conn = self.conn.clone();

        let reply = self
            .round_trip(ctx, async {
                let reply: Value = self
                    .increment_script
                    .key(redis_key.as_ref())
                    .key(&side_key)
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;

        let outcome = parse_window_count(reply, window)?;
        trace!(
            key = %key,
            count = outcome.count,
            reset_after_ms = outcome.reset_after.as_millis() as u64,
            "Incremented fixed window in Redis"
        );
        Ok(outcome)
    }

    async fn take_token(
        &self,
        ctx: &Context,
        key: &str,
        rate: f64,
        burst: u64,
    ) -> Result<TokenTake, StoreError> {
        let redis_key = self.redis_key(key);
        let side_key = format!("{redis_key}{TOKEN_BUCKET_SIDE_SUFFIX}");
        let now = unix_now();
        let mut conn = self.conn.clone();

        let reply = self
            .round_trip(ctx, async {
                let reply: Value = self
                    .take_token_script
                    .key(redis_key.as_ref())
                    .key(&side_key)
                    .arg(rate.to_string())
                    .arg(burst)
                    .arg(now.to_string())
                    .invoke_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;

        let outcome = parse_token_take(reply)?;
        trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Took from token bucket in Redis"
        );
        Ok(outcome)
    }
}

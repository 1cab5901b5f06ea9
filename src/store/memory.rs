//! In-process store backed by sharded concurrent maps.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::{Store, TokenTake, WindowCount};
use crate::context::Context;
use crate::error::StoreError;

/// Windows too long to represent as an instant are capped to this.
const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug)]
struct FixedWindowEntry {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct TokenBucketEntry {
    tokens: f64,
    last_updated: Instant,
    /// When the bucket will have refilled to `burst`. `None` when that
    /// instant cannot be represented, in which case only a later take moves it.
    expires_at: Option<Instant>,
}

/// The two keyed maps. Each `DashMap` shard lock serializes every
/// read-modify-write on the keys it holds, including the sweep.
#[derive(Debug, Default)]
struct Entries {
    fixed_window: DashMap<String, FixedWindowEntry>,
    token_bucket: DashMap<String, TokenBucketEntry>,
}

impl Entries {
    fn increment(&self, key: &str, window: Duration) -> WindowCount {
        let mut entry = self
            .fixed_window
            .entry(key.to_owned())
            .or_insert_with(|| FixedWindowEntry {
                count: 0,
                expires_at: Instant::now(),
            });

        let now = Instant::now();
        if entry.count == 0 || entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now
                .checked_add(window)
                .unwrap_or_else(|| now + MAX_WINDOW);
        }
        entry.count += 1;

        WindowCount {
            count: entry.count,
            reset_after: entry.expires_at.saturating_duration_since(now),
        }
    }

    fn take_token(&self, key: &str, rate: f64, burst: u64) -> TokenTake {
        let burst = burst as f64;

        match self.token_bucket.entry(key.to_owned()) {
            Entry::Vacant(vacant) => {
                let now = Instant::now();
                let tokens = (burst - 1.0).max(0.0);
                vacant.insert(TokenBucketEntry {
                    tokens,
                    last_updated: now,
                    expires_at: refilled_at(now, tokens, rate, burst),
                });
                TokenTake {
                    allowed: burst >= 1.0,
                    remaining: tokens,
                }
            }
            Entry::Occupied(mut occupied) => {
                let now = Instant::now();
                let bucket = occupied.get_mut();

                let elapsed = now.saturating_duration_since(bucket.last_updated).as_secs_f64();
                if elapsed > 0.0 {
                    bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
                }

                let allowed = bucket.tokens >= 1.0;
                if allowed {
                    bucket.tokens -= 1.0;
                }

                bucket.last_updated = now;
                bucket.expires_at = refilled_at(now, bucket.tokens, rate, burst);

                TokenTake {
                    allowed,
                    remaining: bucket.tokens,
                }
            }
        }
    }

    fn sweep(&self, now: Instant) -> (usize, usize) {
        let fixed_before = self.fixed_window.len();
        self.fixed_window.retain(|_, entry| entry.expires_at > now);
        let bucket_before = self.token_bucket.len();
        self.token_bucket
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));

        (
            fixed_before.saturating_sub(self.fixed_window.len()),
            bucket_before.saturating_sub(self.token_bucket.len()),
        )
    }
}

/// The instant a bucket holding `tokens` reaches `burst` when refilled at `rate`.
/// Sweeping a bucket any earlier hands back tokens it has not earned.
fn refilled_at(now: Instant, tokens: f64, rate: f64, burst: f64) -> Option<Instant> {
    Duration::try_from_secs_f64((burst - tokens) / rate)
        .ok()
        .and_then(|idle| now.checked_add(idle))
}

/// Store keeping all rate state in the current process.
///
/// Suitable for a single instance. Expired entries are removed by an
/// optional background sweep started with [`MemoryStore::with_sweeper`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Entries>,
    sweeper: Option<JoinHandle<()>>,
}

impl MemoryStore {
    /// Create a store without background sweeping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose expired entries are swept every `interval`.
    ///
    /// The sweep runs until `ctx` is done or the store is dropped. A zero
    /// interval disables sweeping. Must be called within a Tokio runtime
    /// unless the interval is zero.
    pub fn with_sweeper(ctx: &Context, interval: Duration) -> Self {
        let store = Self::new();
        if interval.is_zero() {
            debug!("Expiry sweep disabled");
            return store;
        }

        let handle = tokio::spawn(run_sweeper(
            Arc::downgrade(&store.entries),
            ctx.clone(),
            interval,
        ));

        Self {
            sweeper: Some(handle),
            ..store
        }
    }

    /// Whether the background sweep is still running.
    pub fn sweeper_active(&self) -> bool {
        self.sweeper
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Remove every expired entry now, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let (fixed, buckets) = self.entries.sweep(Instant::now());
        fixed + buckets
    }

    /// Number of fixed window entries currently held, expired or not.
    pub fn fixed_window_len(&self) -> usize {
        self.entries.fixed_window.len()
    }

    /// Number of token buckets currently held, expired or not.
    pub fn token_bucket_len(&self) -> usize {
        self.entries.token_bucket.len()
    }
}

async fn run_sweeper(entries: Weak<Entries>, ctx: Context, every: Duration) {
    info!(interval_ms = every.as_millis() as u64, "Starting expiry sweep");

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    let done = ctx.done();
    tokio::pin!(done);

    loop {
        tokio::select! {
            _ = &mut done => {
                info!("Expiry sweep canceled");
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(live) = entries.upgrade() else {
            debug!("Store dropped, stopping expiry sweep");
            return;
        };

        let (fixed, buckets) = live.sweep(Instant::now());
        if fixed + buckets > 0 {
            debug!(
                fixed_window = fixed,
                token_bucket = buckets,
                "Swept expired entries"
            );
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(
        &self,
        ctx: &Context,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        if ctx.is_done() {
            return Err(StoreError::Canceled);
        }

        let outcome = self.entries.increment(key, window);
        trace!(
            key = %key,
            count = outcome.count,
            reset_after_ms = outcome.reset_after.as_millis() as u64,
            "Incremented fixed window"
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
        if ctx.is_done() {
            return Err(StoreError::Canceled);
        }

        let outcome = self.entries.take_token(key, rate, burst);
        trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Took from token bucket"
        );
        Ok(outcome)
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use conductor_types::Platform;

use crate::config::{PlatformSettings, RateLimiterConfig};

/// Acquire gave up because the caller's deadline elapsed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireTimeout;

impl std::fmt::Display for AcquireTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rate limiter acquire timed out")
    }
}

impl std::error::Error for AcquireTimeout {}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with lazy refill. Callers are admitted in arrival order:
/// the async `gate` mutex is the fair queue, while the numeric state sits
/// behind a short std lock so observers never contend with a sleeping
/// waiter.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    gate: Mutex<()>,
    state: StdMutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: &RateLimiterConfig) -> Self {
        let capacity = config.capacity.max(1.0);
        Self {
            capacity,
            refill_per_sec: config.refill_per_sec.max(0.0),
            gate: Mutex::new(()),
            state: StdMutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, suspending until one is available or `deadline`
    /// passes. At `tokens == 0` with an already-elapsed deadline this
    /// returns immediately and consumes nothing.
    pub async fn acquire(&self, deadline: Instant) -> Result<(), AcquireTimeout> {
        let _admitted = self.gate.lock().await;
        loop {
            let wait_until = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                if self.refill_per_sec <= 0.0 {
                    return Err(AcquireTimeout);
                }
                let deficit = 1.0 - state.tokens;
                Instant::now() + Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            if wait_until > deadline {
                return Err(AcquireTimeout);
            }
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// When the next whole token will exist, if the bucket is currently
    /// empty. Used by the retry engine to override backoff after a
    /// rate-limit error.
    pub fn next_token_at(&self) -> Option<Instant> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        if state.tokens >= 1.0 || self.refill_per_sec <= 0.0 {
            return None;
        }
        let deficit = 1.0 - state.tokens;
        Some(Instant::now() + Duration::from_secs_f64(deficit / self.refill_per_sec))
    }

    /// Current `(tokens, capacity)` for health snapshots.
    pub fn level(&self) -> (f64, f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        (state.tokens, self.capacity)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed > Duration::ZERO {
            state.tokens =
                (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }
}

/// One bucket per platform, built once from configuration.
pub struct RateLimiter {
    buckets: HashMap<Platform, Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(settings: &PlatformSettings<RateLimiterConfig>) -> Self {
        let buckets = Platform::ALL
            .iter()
            .map(|&platform| {
                (
                    platform,
                    Arc::new(TokenBucket::new(&settings.for_platform(platform))),
                )
            })
            .collect();
        Self { buckets }
    }

    pub fn bucket(&self, platform: Platform) -> Arc<TokenBucket> {
        // Buckets exist for every platform tag by construction.
        self.buckets[&platform].clone()
    }

    pub fn levels(&self) -> HashMap<Platform, (f64, f64)> {
        self.buckets
            .iter()
            .map(|(&platform, bucket)| (platform, bucket.level()))
            .collect()
    }
}

//! Requeue pacing for controller error policies
//!
//! Combines a per-key exponential backoff (1s doubling to 300s, reset on the
//! first clean reconcile) with a global token bucket (10 retries/s, burst
//! 100) so a cluster-wide outage cannot stampede the API server once it
//! recovers. The larger of the two delays wins.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Base delay for the first failure of a key
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Delay ceiling per key
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Global retry rate (tokens per second)
const REFILL_RATE: f64 = 10.0;

/// Global burst capacity
const BURST: f64 = 100.0;

/// Per-key exponential backoff with a global rate limiter
pub struct RequeueBackoff {
    attempts: Mutex<HashMap<String, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl RequeueBackoff {
    /// Create a backoff tracker with the default limits
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket::new(REFILL_RATE, BURST)),
        }
    }

    /// Delay before the next retry of `key`
    ///
    /// Each call counts as one failure of the key and consumes one global
    /// token.
    pub fn next_delay(&self, key: &str) -> Duration {
        let exp = {
            let mut attempts = self.attempts.lock().expect("backoff attempts poisoned");
            let n = attempts.entry(key.to_string()).or_insert(0);
            let delay = exponential_delay(*n);
            *n = n.saturating_add(1);
            delay
        };

        let throttle = {
            let mut bucket = self.bucket.lock().expect("backoff bucket poisoned");
            bucket.take(Instant::now())
        };

        exp.max(throttle)
    }

    /// Forget a key's failure history after a clean reconcile
    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .expect("backoff attempts poisoned")
            .remove(key);
    }
}

fn exponential_delay(failures: u32) -> Duration {
    // 2^failures saturates well before the shift overflows
    let multiplier = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
    BASE_DELAY
        .checked_mul(multiplier.min(u32::MAX as u64) as u32)
        .map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}

/// Minimal token bucket: `take` returns how long the caller must wait for
/// its token.
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn take(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Per-key token-bucket admission control.
///
/// Every key gets `capacity` tokens, refilled continuously at
/// `capacity / period` tokens per second. `admit` never waits: it either
/// consumes a token or reports the key as limited.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Burst capacity and the number of requests allowed per `period`.
    pub capacity: u32,
    pub period: Duration,
}

impl RateLimitConfig {
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self { capacity, period }
    }

    fn refill_rate(&self) -> f64 {
        let secs = self.period.as_secs_f64();
        if secs <= 0.0 {
            f64::INFINITY
        } else {
            self.capacity as f64 / secs
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, capacity: u32, rate: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity as f64);
        self.last_refill = now;
    }

    /// Consume one token. Returns the wait until the next token otherwise.
    fn try_consume(&mut self, capacity: u32, rate: f64, now: Instant) -> Option<Duration> {
        self.refill(capacity, rate, now);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Self::wait_for(self.tokens, rate))
        }
    }

    fn wait_for(tokens: f64, rate: f64) -> Duration {
        let needed = 1.0 - tokens;
        Duration::from_secs_f64((needed / rate).max(0.0))
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        {
            let map = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(b) = map.get(key) {
                return b.clone();
            }
        }
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(self.config.capacity, Instant::now()))))
            .clone()
    }

    /// Check-and-consume one token for `key`.
    pub fn admit(&self, key: &str) -> bool {
        if self.config.capacity == 0 {
            return false;
        }
        let bucket = self.bucket(key);
        let mut b = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        b.try_consume(self.config.capacity, self.config.refill_rate(), Instant::now())
            .is_none()
    }

    /// Time until `key` would be admitted again. `None` when a token is available now.
    pub fn retry_after(&self, key: &str) -> Option<Duration> {
        let bucket = {
            let map = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            map.get(key).cloned()?
        };
        let mut b = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let rate = self.config.refill_rate();
        b.refill(self.config.capacity, rate, Instant::now());
        if b.tokens >= 1.0 {
            None
        } else {
            Some(Bucket::wait_for(b.tokens, rate))
        }
    }

    pub fn reset(&self, key: &str) {
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
    }

    /// Drop buckets untouched for longer than `max_idle`. Returns how many were removed.
    ///
    /// A bucket idle for a full period is back at capacity, so dropping it loses nothing
    /// as long as `max_idle >= period`.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, bucket| {
            let b = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            now.duration_since(b.last_seen) <= max_idle
        });
        before - map.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

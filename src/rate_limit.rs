//! Process-wide token bucket used as a pre-flight admission check.

use std::time::Instant;

use parking_lot::Mutex;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Refills at `rate_per_sec` up to `burst`; each admitted request takes one.
#[derive(Debug)]
pub struct FloodLimiter {
    rate_per_sec: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl FloodLimiter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.rate_per_sec, config.burst)
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = bucket.last_refill.max(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            crate::metrics::FLOOD_REJECTIONS_TOTAL.inc();
            false
        }
    }
}

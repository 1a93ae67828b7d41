// Token-bucket admission control shared by all network calls

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket. `acquire()` blocks the calling worker until one token is
/// available; refill is proportional to elapsed wall time and capped at
/// `capacity`. A rate of zero (or less) disables limiting entirely.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Default capacity is twice the rate (burst headroom), floored at one.
    pub fn new(rate: f64) -> Self {
        Self::with_capacity(rate, (rate * 2.0).max(1.0))
    }

    pub fn with_capacity(rate: f64, capacity: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            rate: rate.max(0.0),
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.rate <= 0.0
    }

    /// Take one token, sleeping only the computed shortfall. The lock is
    /// held across the sleep so refill and debit serialize; starvation is
    /// bounded by `1/rate` seconds per caller.
    pub async fn acquire(&self) {
        if self.is_disabled() {
            return;
        }
        let mut b = self.bucket.lock().await;
        let now = Instant::now();
        let dt = now.duration_since(b.refilled_at).as_secs_f64();
        b.refilled_at = now;
        b.tokens = (b.tokens + dt * self.rate).min(self.capacity);
        if b.tokens < 1.0 {
            let shortfall = 1.0 - b.tokens;
            sleep(Duration::from_secs_f64(shortfall / self.rate)).await;
            b.tokens = 0.0;
            b.refilled_at = Instant::now();
        } else {
            b.tokens -= 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_never_blocks() {
        let rl = RateLimiter::new(0.0);
        let t0 = Instant::now();
        for _ in 0..100 {
            rl.acquire().await;
        }
        assert!(t0.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_throughput_bound() {
        // N acquisitions at rate r take at least (N - capacity) / r seconds.
        let rl = RateLimiter::with_capacity(50.0, 1.0);
        let t0 = Instant::now();
        for _ in 0..5 {
            rl.acquire().await;
        }
        assert!(t0.elapsed() >= Duration::from_secs_f64((5.0 - 1.0) / 50.0));
    }

    #[tokio::test]
    async fn test_burst_within_capacity_is_free() {
        let rl = RateLimiter::with_capacity(1.0, 4.0);
        let t0 = Instant::now();
        for _ in 0..4 {
            rl.acquire().await;
        }
        assert!(t0.elapsed() < Duration::from_millis(100));
    }
}

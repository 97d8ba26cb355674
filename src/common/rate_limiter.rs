//! Token-bucket rate limiter for brokerage API calls

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum requests allowed per refill interval
    pub max_requests_per_second: usize,
    /// Token refill interval
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 10,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_rate(mut self, requests_per_second: usize) -> Self {
        self.max_requests_per_second = requests_per_second;
        self
    }

    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }
}

/// Token-bucket limiter backed by a semaphore. Permits are consumed, not
/// returned; the bucket refills on a fixed interval.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_permits: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_requests_per_second)),
            max_permits: config.max_requests_per_second,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval: config.refill_interval,
        }
    }

    /// Wait for a permit, refilling the bucket first if due
    pub async fn acquire(&self) {
        self.try_refill().await;

        let permit = self
            .permits
            .acquire()
            .await
            .expect("Semaphore should not be closed");
        permit.forget();
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn try_refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        let elapsed = last_refill.elapsed();

        if elapsed >= self.refill_interval {
            let current = self.permits.available_permits();
            let to_add = self.max_permits.saturating_sub(current);
            if to_add > 0 {
                self.permits.add_permits(to_add);
            }
            *last_refill = Instant::now();
        }
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            permits: Arc::clone(&self.permits),
            max_permits: self.max_permits,
            last_refill: Arc::clone(&self.last_refill),
            refill_interval: self.refill_interval,
        }
    }
}

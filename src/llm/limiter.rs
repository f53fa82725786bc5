//! Request throttling for the LLM provider.
//!
//! Three gates compose: a concurrency semaphore bounding in-flight
//! requests, and token buckets for requests-per-minute and
//! tokens-per-minute. On exhaustion callers wait; acquisition never fails.
//! The provider is the only component allowed to throttle; pipeline
//! workers must not add sleeps of their own.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// A token bucket refilled continuously at `capacity` per minute.
struct Bucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: f64) -> Self {
        Self {
            capacity: per_minute,
            tokens: per_minute,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.capacity / 60.0).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `amount` tokens, or return how long to wait for them.
    fn try_take(&mut self, amount: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            None
        } else {
            let deficit = amount - self.tokens;
            Some(Duration::from_secs_f64(deficit * 60.0 / self.capacity))
        }
    }
}

/// Shared limiter enforcing the provider's rate caps.
pub struct RateLimiter {
    concurrency: Semaphore,
    rpm: Option<Mutex<Bucket>>,
    tpm: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            concurrency: Semaphore::new(config.concurrency.max(1)),
            rpm: (config.rpm > 0).then(|| Mutex::new(Bucket::new(config.rpm as f64))),
            tpm: (config.tpm > 0).then(|| Mutex::new(Bucket::new(config.tpm as f64))),
        }
    }

    /// Wait for a request slot plus rpm/tpm budget for `tokens` tokens.
    /// The returned permit bounds in-flight concurrency; drop it when the
    /// request completes.
    pub async fn acquire(&self, tokens: usize) -> SemaphorePermit<'_> {
        // Semaphore::acquire only errors when the semaphore is closed,
        // which never happens here.
        let permit = self
            .concurrency
            .acquire()
            .await
            .expect("rate limiter semaphore closed");

        self.wait_for(&self.rpm, 1.0).await;
        self.wait_for(&self.tpm, tokens as f64).await;

        permit
    }

    async fn wait_for(&self, bucket: &Option<Mutex<Bucket>>, amount: f64) {
        let Some(bucket) = bucket else { return };
        loop {
            let wait = {
                let mut guard = bucket.lock().expect("rate limiter bucket poisoned");
                guard.try_take(amount, Instant::now())
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Currently available request slots (observability only).
    pub fn available_slots(&self) -> usize {
        self.concurrency.available_permits()
    }
}

//! Token bucket rate limiter shared by every transfer of an engine
//!
//! Bytes read from the network pay for themselves before they are handed
//! on. The bucket holds at most one second worth of tokens.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Largest slice a single acquire call waits for, so concurrent transfers
/// take turns instead of one draining the bucket
const MAX_ACQUIRE: u64 = 16 * 1024;

/// Longest single sleep while waiting for tokens
const MAX_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<Bucket>>,
}

struct Bucket {
    /// Bytes per second; `None` means unlimited
    rate: Option<u64>,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Limiter for `bytes_per_second`; `None` or 0 disables throttling
    pub fn new(bytes_per_second: Option<u64>) -> Self {
        let rate = bytes_per_second.filter(|&limit| limit > 0);
        Self {
            state: Arc::new(Mutex::new(Bucket {
                rate,
                tokens: rate.unwrap_or(0) as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Change the limit; running transfers pick it up on their next chunk
    pub async fn set_limit(&self, bytes_per_second: Option<u64>) {
        let mut bucket = self.state.lock().await;
        bucket.rate = bytes_per_second.filter(|&limit| limit > 0);
        if let Some(rate) = bucket.rate {
            bucket.tokens = bucket.tokens.min(rate as f64);
        }
        bucket.last_refill = Instant::now();
    }

    pub async fn limit(&self) -> Option<u64> {
        self.state.lock().await.rate
    }

    /// Wait until `bytes` may pass
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            remaining -= self.acquire_slice(remaining.min(MAX_ACQUIRE)).await;
        }
    }

    /// Wait for up to `wanted` tokens and return how many were taken
    async fn acquire_slice(&self, wanted: u64) -> u64 {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                let Some(rate) = bucket.rate else {
                    return wanted;
                };
                bucket.refill(rate);

                // The bucket never holds more than `rate` tokens
                let bytes = wanted.min(rate);
                if bucket.tokens >= bytes as f64 {
                    bucket.tokens -= bytes as f64;
                    return bytes;
                }

                let needed = bytes as f64 - bucket.tokens;
                Duration::from_secs_f64(needed / rate as f64).min(MAX_WAIT)
            };

            // Sleep outside the lock so other transfers can check in
            tokio::time::sleep(wait).await;
        }
    }
}

impl Bucket {
    fn refill(&mut self, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.001 {
            self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limited_transfer_waits_once_bucket_is_empty() {
        let limiter = RateLimiter::new(Some(1000));

        let start = Instant::now();
        limiter.acquire(500).await;
        limiter.acquire(500).await;
        assert!(start.elapsed().as_millis() < 50);

        // Bucket is empty now, another 500 bytes take about half a second
        limiter.acquire(500).await;
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test]
    async fn request_larger_than_the_bucket_is_paid_off_over_time() {
        let limiter = RateLimiter::new(Some(1000));

        let start = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), limiter.acquire(2000))
            .await
            .expect("acquire larger than the limit never finished");

        // First 1000 bytes come from the full bucket, the rest take a second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn slow_limit_still_moves_large_chunks() {
        let limiter = RateLimiter::new(Some(100_000));

        let start = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), limiter.acquire(150_000))
            .await
            .expect("acquire of several slices never finished");
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::new(Some(0));
        assert_eq!(limiter.limit().await, None);

        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(1024 * 1024).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn limit_can_be_lifted() {
        let limiter = RateLimiter::new(Some(10));
        limiter.acquire(10).await;
        limiter.set_limit(None).await;

        let start = Instant::now();
        limiter.acquire(10_000).await;
        assert!(start.elapsed().as_millis() < 50);
    }
}

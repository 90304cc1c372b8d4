//! Per-IP request counter with a daily reset.

use crate::shutdown::Shutdown;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

pub const RESET_INTERVAL: Duration = Duration::from_secs(86_400);

pub const RATE_LIMITED_MESSAGE: &str =
    "You have exceeded the number of requests allowed from your IP address for today. Please try again tomorrow.";

/// Counts requests per client address. Not persisted; a restart starts
/// from zero.
#[derive(Debug)]
pub struct RateLimiter {
    /// 0 disables limiting
    limit: u32,
    buckets: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one request from `ip`. Returns false once the address went
    /// past the limit.
    pub fn check(&self, ip: &str) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned map only holds counters; keep serving.
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = buckets.entry(ip.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        if *count > self.limit {
            if *count == self.limit + 1 {
                warn!(ip, limit = self.limit, "Client went past the daily rate limit");
            }
            return false;
        }
        true
    }

    /// Current count for `ip`.
    pub fn count(&self, ip: &str) -> u32 {
        match self.buckets.lock() {
            Ok(guard) => guard.get(ip).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(ip).copied().unwrap_or(0),
        }
    }

    /// Swap in an empty map.
    pub fn reset(&self) -> usize {
        let previous = match self.buckets.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        previous.len()
    }

    /// Reset every `interval` until shutdown.
    pub async fn run_reset_loop(self: Arc<Self>, interval: Duration, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cleared = self.reset();
                    info!(cleared, "Rate limit buckets reset");
                }
                _ = shutdown.wait() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_disables() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.check("192.0.2.1"));
        }
        assert_eq!(limiter.count("192.0.2.1"), 0);
    }

    #[test]
    fn blocks_past_limit_until_reset() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.check("192.0.2.1"));
        }
        assert!(!limiter.check("192.0.2.1"));
        assert!(!limiter.check("192.0.2.1"));
        // other addresses unaffected
        assert!(limiter.check("192.0.2.2"));

        assert_eq!(limiter.reset(), 2);
        assert!(limiter.check("192.0.2.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_loop_clears_daily() {
        let limiter = Arc::new(RateLimiter::new(1));
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(
            limiter
                .clone()
                .run_reset_loop(RESET_INTERVAL, shutdown.clone()),
        );

        assert!(limiter.check("198.51.100.7"));
        assert!(!limiter.check("198.51.100.7"));

        tokio::time::sleep(RESET_INTERVAL + Duration::from_secs(1)).await;
        assert!(limiter.check("198.51.100.7"));

        shutdown.trigger();
        handle.await.unwrap();
    }
}

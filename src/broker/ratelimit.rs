//! Per-entity oracle call budget over a sliding window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

pub struct RateLimiter {
    calls: RwLock<HashMap<String, VecDeque<Instant>>>,
    max_calls: u32,
    window: Duration,
}

impl RateLimiter {
    /// `max_calls == 0` disables limiting.
    pub fn new(max_calls: u32, window: Duration) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            max_calls,
            window,
        }
    }

    /// Record a call for `entity` if the budget allows it. On refusal,
    /// returns how long until the oldest call in the window expires.
    ///
    /// Check and record happen under one write lock, so two concurrent
    /// callers can never both take the last slot.
    pub async fn check_and_record(&self, entity: &str) -> Result<(), Duration> {
        if self.max_calls == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut calls = self.calls.write().await;
        let window = calls.entry(entity.to_string()).or_default();

        while window
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            window.pop_front();
        }

        if window.len() as u32 >= self.max_calls {
            let retry_after = window
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window);
            debug!(
                entity,
                calls = window.len(),
                max = self.max_calls,
                retry_after_ms = retry_after.as_millis() as u64,
                "oracle rate limit exceeded"
            );
            return Err(retry_after);
        }

        window.push_back(now);
        Ok(())
    }

    /// Calls currently counted against `entity`.
    pub async fn in_window(&self, entity: &str) -> usize {
        let now = Instant::now();
        let calls = self.calls.read().await;
        calls
            .get(entity)
            .map(|w| w.iter().filter(|&&t| now.duration_since(t) < self.window).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_is_per_entity() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check_and_record("a").await.is_ok());
        assert!(limiter.check_and_record("a").await.is_ok());
        assert!(limiter.check_and_record("a").await.is_err());
        assert!(limiter.check_and_record("b").await.is_ok());
        assert_eq!(limiter.in_window("a").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.check_and_record("a").await.unwrap();
        let retry = limiter.check_and_record("a").await.unwrap_err();
        assert!(retry <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.check_and_record("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_disables() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        for _ in 0..100 {
            assert!(limiter.check_and_record("a").await.is_ok());
        }
    }
}

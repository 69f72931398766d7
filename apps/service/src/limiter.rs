use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep};

use crate::error::EngineError;

/// Bounds probe concurrency and start rate
///
/// Two independent limits apply: at most `max_concurrent` permits are held
/// at once, and at most `max_per_window` permits are handed out in any
/// sliding window of length `window`.
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_per_window: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

/// Held while a probe runs; dropping it frees the concurrency slot
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, max_per_window: usize, window: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_per_window: max_per_window.max(1),
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait for both a concurrency slot and a window slot
    pub async fn acquire(&self) -> Result<RatePermit, EngineError> {
        let permit =
            self.permits.clone().acquire_owned().await.map_err(|_| EngineError::LimiterClosed)?;

        while let Some(wait) = self.reserve_window_slot() {
            sleep(wait).await;
        }

        Ok(RatePermit { _permit: permit })
    }

    /// Take a permit only if one is available right now
    pub fn try_acquire(&self) -> Option<RatePermit> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        match self.reserve_window_slot() {
            None => Some(RatePermit { _permit: permit }),
            Some(_) => None,
        }
    }

    /// Records an admission and returns `None`, or how long until one frees up
    fn reserve_window_slot(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut admitted = self.admitted.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        while let Some(&oldest) = admitted.front() {
            if now.duration_since(oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < self.max_per_window {
            admitted.push_back(now);
            return None;
        }

        admitted.front().map(|&oldest| (oldest + self.window).saturating_duration_since(now))
    }

    /// Concurrency slots not currently held
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wake every waiter with an error; later acquisitions fail too
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let limiter = Arc::new(RateLimiter::new(3, 1000, Duration::from_secs(1)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let limiter = limiter.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = limiter.acquire().await.unwrap();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limits_start_rate() {
        let limiter = RateLimiter::new(100, 2, Duration::from_secs(1));
        let start = Instant::now();

        for _ in 0..5 {
            drop(limiter.acquire().await.unwrap());
        }

        // Five starts with two per second need at least two full windows
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_respects_window() {
        let limiter = RateLimiter::new(10, 1, Duration::from_millis(500));
        assert!(limiter.try_acquire().is_some());
        assert!(limiter.try_acquire().is_none());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_closed_limiter_rejects() {
        let limiter = RateLimiter::new(1, 10, Duration::from_secs(1));
        limiter.close();
        assert!(matches!(limiter.acquire().await, Err(EngineError::LimiterClosed)));
    }
}

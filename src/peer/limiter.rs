//! Transfer rate limiting
//!
//! A windowed byte budget. Each caller adds its bytes to the current
//! window and sleeps until the time those bytes should have taken at the
//! configured rate, measured from the start of the window. The window
//! counters sit behind their own lock so a sleeping transfer never holds
//! it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Length of one accounting window
pub const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    started: Instant,
    bytes: u64,
}

/// Bytes-per-second limiter; a rate of 0 is unlimited
#[derive(Debug)]
pub struct RateLimiter {
    rate: AtomicU64,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self { rate: AtomicU64::new(bytes_per_sec), window: Mutex::new(Window { started: Instant::now(), bytes: 0 }) }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Account `bytes` and return how long the caller must wait
    pub fn reserve(&self, bytes: usize) -> Duration {
        let rate = self.rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        let Ok(mut window) = self.window.lock() else {
            return Duration::ZERO;
        };

        let elapsed = window.started.elapsed();
        let owed = Duration::from_secs_f64(window.bytes as f64 / rate as f64);
        // A window only restarts once its budget has been paid off
        if elapsed >= WINDOW && owed <= elapsed {
            window.started = Instant::now();
            window.bytes = 0;
        }

        window.bytes += bytes as u64;
        let release = Duration::from_secs_f64(window.bytes as f64 / rate as f64);
        release.saturating_sub(window.started.elapsed())
    }

    /// Wait until `bytes` fit in the budget
    pub async fn acquire(&self, bytes: usize) {
        let delay = self.reserve(bytes);
        if !delay.is_zero() {
            trace!("Rate limited for {:?} ({} bytes)", delay, bytes);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Upload and download limiters shared by every connection
#[derive(Debug, Clone)]
pub struct Bandwidth {
    pub upload: Arc<RateLimiter>,
    pub download: Arc<RateLimiter>,
}

impl Bandwidth {
    pub fn new(upload_limit: u64, download_limit: u64) -> Self {
        Self { upload: Arc::new(RateLimiter::new(upload_limit)), download: Arc::new(RateLimiter::new(download_limit)) }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }
}

impl Default for Bandwidth {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        assert_eq!(limiter.reserve(10_000_000), Duration::ZERO);
    }

    #[test]
    fn test_budget_accumulates() {
        let limiter = RateLimiter::new(1000);
        let first = limiter.reserve(500);
        assert!(first <= Duration::from_millis(500));
        let second = limiter.reserve(1500);
        assert!(second > Duration::from_millis(1500));
        assert!(second <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_acquire_sleeps() {
        let limiter = RateLimiter::new(10_000);
        let start = Instant::now();
        limiter.acquire(1000).await;
        limiter.acquire(1000).await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_rate_change() {
        let limiter = RateLimiter::new(100);
        limiter.set_rate(0);
        assert_eq!(limiter.reserve(1_000_000), Duration::ZERO);
        assert_eq!(Bandwidth::default().upload.rate(), 0);
    }
}

//! Sliding-window limit on login attempts per client address.
//!
//! Each client keeps the timestamps of its recent attempts; attempts older
//! than the window are discarded before counting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Shared login limiter, safe to call from concurrent connection tasks.
#[derive(Debug)]
pub struct LoginRateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-client attempt timestamps.
    entries: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl LoginRateLimiter {
    /// Create a new limiter.
    ///
    /// * `max_attempts` - Maximum allowed attempts within the window. `0`
    ///   disables limiting.
    /// * `window` - Window duration.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Vec<Instant>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if an attempt from `ip` is allowed, and record it if so.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&self, ip: IpAddr) -> bool {
        if self.max_attempts == 0 {
            return true;
        }

        let now = Instant::now();
        let mut entries = self.lock();
        let attempts = entries.entry(ip).or_default();

        // Remove expired entries
        attempts.retain(|t| now.duration_since(*t) < self.window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&self) {
        let now = Instant::now();
        self.lock().retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < self.window);
            !attempts.is_empty()
        });
    }

    /// Number of clients with recent attempts.
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

//! Sliding-window request limiter.
//!
//! An account is limited when an externally imposed deadline (from an
//! upstream 429) is still in the future, or when any configured window is
//! saturated. All operations take `now` explicitly so callers and tests stay
//! deterministic.

use chatmux_core::config::{default_rate_limit_windows, RateLimitWindow};
use tracing::warn;

/// Cooldown applied when upstream signals a rate limit.
pub const EXTERNAL_LIMIT_SECS: u64 = 60;

#[derive(Debug)]
pub struct RateLimiter {
    windows: Vec<RateLimitWindow>,
    timestamps: Vec<i64>,
    rate_limited_until: i64,
}

impl RateLimiter {
    pub fn new(windows: Vec<RateLimitWindow>) -> Self {
        let windows = if windows.is_empty() {
            default_rate_limit_windows()
        } else {
            windows
        };
        Self {
            windows,
            timestamps: Vec::new(),
            rate_limited_until: 0,
        }
    }

    fn max_window_secs(&self) -> i64 {
        self.windows.iter().map(|w| w.duration).max().unwrap_or(0) as i64
    }

    /// Drop samples older than the largest window to bound memory.
    fn prune(&mut self, now: i64) {
        let cutoff = now - self.max_window_secs();
        self.timestamps.retain(|ts| *ts > cutoff);
    }

    /// Register one request at `now`.
    pub fn record(&mut self, now: i64) {
        self.timestamps.push(now);
        self.prune(now);
    }

    /// External deadline first, then each window in configured order.
    /// A sample at exactly `now - duration` falls outside the window.
    pub fn is_limited(&mut self, now: i64) -> bool {
        if now < self.rate_limited_until {
            return true;
        }

        self.prune(now);
        for window in &self.windows {
            let window_start = now - window.duration as i64;
            let in_window = self.timestamps.iter().filter(|ts| **ts > window_start).count();
            if in_window >= window.max_requests as usize {
                warn!(
                    requests = in_window,
                    window_secs = window.duration,
                    max = window.max_requests,
                    "rate limit window saturated"
                );
                return true;
            }
        }
        false
    }

    /// Push the external deadline out; never pulls an existing one in.
    pub fn mark_external(&mut self, now: i64, duration_secs: u64) {
        self.rate_limited_until = self.rate_limited_until.max(now + duration_secs as i64);
    }

    pub fn rate_limited_until(&self) -> i64 {
        self.rate_limited_until
    }
}

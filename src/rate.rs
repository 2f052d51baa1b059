//! Rate arithmetic and active-time measurement.
//!
//! [`RateCalculator`] is pure: it turns a cumulative count and an elapsed
//! active time into a labeled rate. [`ActiveClock`] measures that active
//! time, accumulating only the intervals between `start` and `stop`.
//!
//! The clock reads `tokio::time::Instant`, which falls back to the system
//! monotonic clock outside a runtime and honours a paused runtime clock in
//! tests.

use crate::iteration::IterationSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// A rate together with the window it is expressed over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestRate {
    pub value: f64,
    pub window_ms: u64,
}

impl RequestRate {
    pub fn zero(window: Duration) -> Self {
        Self {
            value: 0.0,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Window label such as `1s`, `5s` or `1500ms`
    pub fn label(&self) -> String {
        if self.window_ms % 1000 == 0 {
            format!("{}s", self.window_ms / 1000)
        } else {
            format!("{}ms", self.window_ms)
        }
    }
}

impl std::fmt::Display for RequestRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2} req/{}", self.value, self.label())
    }
}

/// Converts cumulative counters into per-window rates.
#[derive(Debug, Clone, Copy)]
pub struct RateCalculator {
    rate_window: Duration,
}

impl RateCalculator {
    pub fn new(rate_window: Duration) -> Self {
        Self { rate_window }
    }

    pub fn rate_window(&self) -> Duration {
        self.rate_window
    }

    /// Requests per rate window (one second by default).
    ///
    /// Reads zero until the active time exceeds one window so a handful of
    /// requests in the first few milliseconds do not report an absurd rate.
    pub fn requests_rate(&self, count: u64, elapsed: Duration) -> RequestRate {
        scaled_rate(count, elapsed, self.rate_window)
    }

    /// Requests per cooldown window, for modes that batch around a cooldown.
    ///
    /// Returns `None` when the iteration's mode has no cooldown window.
    pub fn cooldown_rate(
        &self,
        count: u64,
        elapsed: Duration,
        settings: &IterationSettings,
    ) -> Option<RequestRate> {
        settings
            .cooldown_window()
            .map(|window| scaled_rate(count, elapsed, window))
    }

    /// Bytes per second with `floor` as the smallest elapsed time divided by.
    pub fn bytes_per_second(&self, bytes: u64, elapsed: Duration, floor: Duration) -> f64 {
        let secs = elapsed.max(floor).as_secs_f64();
        if secs > 0.0 {
            bytes as f64 / secs
        } else {
            0.0
        }
    }
}

fn scaled_rate(count: u64, elapsed: Duration, window: Duration) -> RequestRate {
    if window.is_zero() || elapsed <= window {
        return RequestRate::zero(window);
    }

    RequestRate {
        value: count as f64 * window.as_secs_f64() / elapsed.as_secs_f64(),
        window_ms: window.as_millis() as u64,
    }
}

/// Error rate `failed / completed`, zero when nothing has completed.
pub fn error_rate(failed: u64, completed: u64) -> f64 {
    if completed == 0 {
        0.0
    } else {
        failed as f64 / completed as f64
    }
}

/// Accumulated wall-clock time spent in the started state.
#[derive(Debug, Clone, Default)]
pub struct ActiveClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl ActiveClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume measuring. Returns `false` if the clock was already running.
    pub fn start(&mut self) -> bool {
        if self.running_since.is_some() {
            return false;
        }
        self.running_since = Some(Instant::now());
        true
    }

    /// Pause measuring, keeping what has accumulated so far.
    pub fn stop(&mut self) -> bool {
        match self.running_since.take() {
            Some(since) => {
                self.accumulated += since.elapsed();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }
}

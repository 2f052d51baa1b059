//! Tunables for the live metrics core.
//!
//! Every field has a default in [`crate::defaults`]. The demo binary builds a
//! [`MetricsConfig`] from its command line; embedders construct one directly
//! or start from `MetricsConfig::default()`.

use crate::{
    error::{MetricsError, MetricsResult},
    iteration::duration_millis,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Snapshots kept per (iteration, metric kind) before the oldest are evicted
    pub history_capacity: usize,

    /// Cadence of the throughput and data-transmission recompute task
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Largest latency sample the histograms can represent, in milliseconds
    pub histogram_highest_ms: u64,

    /// Histogram precision (1 to 5)
    pub histogram_significant_figures: u8,

    /// Window the primary request rate is expressed over
    #[serde(with = "duration_millis")]
    pub rate_window: Duration,

    /// Smallest elapsed time divided by when computing byte rates
    #[serde(with = "duration_millis")]
    pub transfer_elapsed_floor: Duration,

    /// Longest an update waits for an aggregator lock before it is dropped
    #[serde(with = "duration_millis")]
    pub lock_wait: Duration,

    /// Consecutive lock timeouts after which warnings become errors
    pub lock_escalation_threshold: u32,

    /// How often the export pump polls for new snapshots
    #[serde(with = "duration_millis")]
    pub export_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        use crate::defaults;

        Self {
            history_capacity: defaults::HISTORY_CAPACITY,
            tick_interval: defaults::TICK_INTERVAL,
            histogram_highest_ms: defaults::HISTOGRAM_HIGHEST_MS,
            histogram_significant_figures: defaults::HISTOGRAM_SIGNIFICANT_FIGURES,
            rate_window: defaults::RATE_WINDOW,
            transfer_elapsed_floor: defaults::TRANSFER_ELAPSED_FLOOR,
            lock_wait: defaults::LOCK_WAIT,
            lock_escalation_threshold: defaults::LOCK_ESCALATION_THRESHOLD,
            export_interval: defaults::EXPORT_INTERVAL,
        }
    }
}

impl MetricsConfig {
    /// Reject settings the aggregators cannot work with
    pub fn validate(&self) -> MetricsResult<()> {
        if self.history_capacity == 0 {
            return Err(MetricsError::InvalidConfig(
                "history capacity must be at least 1".to_string(),
            ));
        }

        if self.tick_interval.is_zero() {
            return Err(MetricsError::InvalidConfig(
                "tick interval must be greater than zero".to_string(),
            ));
        }

        if self.rate_window.is_zero() {
            return Err(MetricsError::InvalidConfig(
                "rate window must be greater than zero".to_string(),
            ));
        }

        if self.export_interval.is_zero() {
            return Err(MetricsError::InvalidConfig(
                "export interval must be greater than zero".to_string(),
            ));
        }

        if self.histogram_highest_ms < 2 {
            return Err(MetricsError::InvalidConfig(format!(
                "histogram upper bound must be at least 2 ms, got {}",
                self.histogram_highest_ms
            )));
        }

        if !(1..=5).contains(&self.histogram_significant_figures) {
            return Err(MetricsError::InvalidConfig(format!(
                "histogram significant figures must be between 1 and 5, got {}",
                self.histogram_significant_figures
            )));
        }

        if self.lock_escalation_threshold == 0 {
            return Err(MetricsError::InvalidConfig(
                "lock escalation threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

use crate::error::MetricsResult;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// The four percentile readings published for every timing component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentileReadings {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Fixed-memory latency histogram using an HDR histogram for percentile queries
///
/// Samples are whole milliseconds. Anything above the configured upper bound
/// is clamped to it rather than rejected, so an exploding latency still shows
/// up at the top of the range.
pub struct PercentileHistogram {
    histogram: Histogram<u64>,
    highest_value: u64,
    min: Option<u64>,
    max: u64,
}

impl PercentileHistogram {
    /// Create a histogram covering `0..=highest_value` ms with `significant_figures` precision
    pub fn new(highest_value: u64, significant_figures: u8) -> MetricsResult<Self> {
        let histogram = Histogram::<u64>::new_with_bounds(1, highest_value.max(2), significant_figures)?;

        Ok(Self {
            histogram,
            highest_value: highest_value.max(2),
            min: None,
            max: 0,
        })
    }

    /// Record one sample, clamped into the histogram's range
    pub fn record(&mut self, value: u64) -> MetricsResult<()> {
        let clamped = value.min(self.highest_value);
        self.histogram.record(clamped)?;
        self.min = Some(self.min.map_or(clamped, |min| min.min(clamped)));
        self.max = self.max.max(clamped);
        Ok(())
    }

    /// Value below which `percentile`% of samples fall.
    ///
    /// `percentile` is clamped into `(0, 100]`. The reading never leaves the
    /// range of recorded samples, so bucket quantization cannot push it past
    /// the observed maximum.
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        let Some(min) = self.min else {
            return 0;
        };

        let percentile = if percentile.is_nan() {
            100.0
        } else {
            percentile.clamp(f64::MIN_POSITIVE, 100.0)
        };
        self.histogram
            .value_at_percentile(percentile)
            .clamp(min, self.max)
    }

    pub fn readings(&self) -> PercentileReadings {
        PercentileReadings {
            p50: self.value_at_percentile(50.0),
            p90: self.value_at_percentile(90.0),
            p95: self.value_at_percentile(95.0),
            p99: self.value_at_percentile(99.0),
        }
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min(&self) -> Option<u64> {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn highest_value(&self) -> u64 {
        self.highest_value
    }
}

impl std::fmt::Debug for PercentileHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PercentileHistogram")
            .field("samples", &self.len())
            .field("min", &self.min)
            .field("max", &self.max)
            .field("highest_value", &self.highest_value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram() -> PercentileHistogram {
        PercentileHistogram::new(1_000_000, 3).unwrap()
    }

    #[test]
    fn test_empty_histogram_reads_zero() {
        let h = histogram();
        assert!(h.is_empty());
        assert_eq!(h.readings(), PercentileReadings::default());
    }

    #[test]
    fn test_percentiles_of_small_series() {
        let mut h = histogram();
        for value in [100, 200, 300, 400, 500] {
            h.record(value).unwrap();
        }

        assert_eq!(h.len(), 5);
        assert_eq!(h.value_at_percentile(50.0), 300);
        assert_eq!(h.value_at_percentile(100.0), 500);
        assert_eq!(h.value_at_percentile(0.0), 100);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let mut h = histogram();
        h.record(5_000_000).unwrap();
        h.record(0).unwrap();

        assert_eq!(h.len(), 2);
        assert_eq!(h.max(), 1_000_000);
        assert_eq!(h.min(), Some(0));
        assert_eq!(h.value_at_percentile(100.0), 1_000_000);
    }

    #[test]
    fn test_readings_stay_within_observed_range() {
        // Large values fall into coarse buckets whose upper edge exceeds the sample
        let mut h = histogram();
        for value in [123_457, 234_567, 345_679] {
            h.record(value).unwrap();
        }

        let readings = h.readings();
        for reading in [readings.p50, readings.p90, readings.p95, readings.p99] {
            assert!(reading >= 123_457);
            assert!(reading <= 345_679);
        }
    }

    #[test]
    fn test_invalid_precision_is_rejected() {
        assert!(PercentileHistogram::new(1_000, 6).is_err());
    }
}

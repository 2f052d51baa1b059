//! Bytes sent and received, per-request averages and transfer rates.
//!
//! Averages divide by the completed request count, taken from the throughput
//! aggregator's latest snapshot at each recompute. Rates divide by the
//! active time, with a small floor so the first few transfers do not report
//! an absurd rate.

use super::{AggregatorContext, GuardedState, MetricAggregator, Tick, Ticker};
use crate::{
    error::MetricsResult,
    events::{MetricEvent, TransferDirection},
    iteration::IterationIdentity,
    rate::{ActiveClock, RateCalculator},
    snapshot::{DataTransmissionSnapshot, MetricKind, MetricSnapshot},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct TransferState {
    clock: ActiveClock,
    bytes_sent: u64,
    bytes_received: u64,
    /// Completed requests as of the last recompute
    completed_requests: u64,
}

#[derive(Debug)]
struct TransferCore {
    ctx: AggregatorContext,
    rates: RateCalculator,
    state: GuardedState<TransferState>,
}

fn per_request(total: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        total as f64 / requests as f64
    }
}

impl TransferCore {
    fn build(&self, state: &TransferState) -> MetricSnapshot {
        let elapsed = state.clock.elapsed();
        let floor = self.ctx.config.transfer_elapsed_floor;
        let rate = |bytes: u64| self.rates.bytes_per_second(bytes, elapsed, floor);

        MetricSnapshot::DataTransmission(DataTransmissionSnapshot {
            identity: Arc::clone(&self.ctx.identity),
            timestamp: Utc::now(),
            total_bytes_sent: state.bytes_sent,
            total_bytes_received: state.bytes_received,
            average_bytes_sent: per_request(state.bytes_sent, state.completed_requests),
            average_bytes_received: per_request(state.bytes_received, state.completed_requests),
            upstream_bytes_per_second: rate(state.bytes_sent),
            downstream_bytes_per_second: rate(state.bytes_received),
            total_bytes_per_second: rate(state.bytes_sent.saturating_add(state.bytes_received)),
            elapsed_active_ms: elapsed.as_millis() as u64,
        })
    }

    fn push(&self, state: &TransferState) -> Arc<MetricSnapshot> {
        self.ctx.store.push(self.build(state))
    }

    fn completed_requests(&self) -> Option<u64> {
        let latest = self
            .ctx
            .store
            .latest(self.ctx.iteration_id(), MetricKind::Throughput)?;
        match latest.as_throughput() {
            Ok(throughput) => Some(throughput.completed_requests()),
            Err(e) => {
                warn!("Ignoring throughput for {}: {}", self.ctx.identity.label(), e);
                None
            }
        }
    }

    fn recompute(&self, force: bool) -> MetricsResult<Option<Arc<MetricSnapshot>>> {
        let completed = self.completed_requests();

        self.state.with(|state| {
            if !force && !state.clock.is_running() {
                return None;
            }
            if let Some(completed) = completed {
                state.completed_requests = state.completed_requests.max(completed);
            }
            Some(self.push(state))
        })
    }
}

impl Tick for TransferCore {
    fn tick(&self) {
        match self.recompute(false) {
            Ok(Some(_)) => trace!("Recomputed data transmission for {}", self.ctx.identity.label()),
            Ok(None) => {}
            Err(e) => warn!(
                "Skipped data transmission recompute for {}: {}",
                self.ctx.identity.label(),
                e
            ),
        }
    }
}

#[derive(Debug)]
pub struct DataTransmissionAggregator {
    core: Arc<TransferCore>,
    ticker: Ticker,
}

impl DataTransmissionAggregator {
    pub fn new(ctx: AggregatorContext) -> Self {
        let ticker = Ticker::new(
            format!("data transmission of {}", ctx.identity.label()),
            ctx.config.tick_interval,
        );
        let core = TransferCore {
            rates: RateCalculator::new(ctx.config.rate_window),
            state: GuardedState::new(MetricKind::DataTransmission, &ctx, TransferState::default()),
            ctx,
        };

        Self {
            core: Arc::new(core),
            ticker,
        }
    }

    pub fn record_sent(&self, bytes: u64) -> MetricsResult<()> {
        self.record(TransferDirection::Sent, bytes)
    }

    pub fn record_received(&self, bytes: u64) -> MetricsResult<()> {
        self.record(TransferDirection::Received, bytes)
    }

    pub fn record(&self, direction: TransferDirection, bytes: u64) -> MetricsResult<()> {
        self.core.state.with(|state| {
            match direction {
                TransferDirection::Sent => state.bytes_sent = state.bytes_sent.saturating_add(bytes),
                TransferDirection::Received => {
                    state.bytes_received = state.bytes_received.saturating_add(bytes)
                }
            }
            self.core.push(state);
        })
    }

    /// Refresh the request count and rates now, as a timer tick would
    pub fn tick(&self) {
        self.core.tick();
    }
}

impl MetricAggregator for DataTransmissionAggregator {
    fn kind(&self) -> MetricKind {
        MetricKind::DataTransmission
    }

    fn identity(&self) -> &Arc<IterationIdentity> {
        &self.core.ctx.identity
    }

    fn update(&self, event: &MetricEvent) -> MetricsResult<()> {
        match event {
            MetricEvent::Transfer { direction, bytes } => self.record(*direction, *bytes),
            other => Err(self.core.ctx.unsupported(self.kind(), other)),
        }
    }

    fn start(&self) -> MetricsResult<()> {
        self.core.state.with(|state| state.clock.start())?;
        self.ticker.start(Arc::clone(&self.core));
        Ok(())
    }

    fn stop(&self) -> MetricsResult<()> {
        self.ticker.stop();
        self.core.state.with(|state| state.clock.stop())?;
        self.core.recompute(true)?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.core
            .state
            .with(|state| state.clock.is_running())
            .unwrap_or(false)
    }

    fn snapshot(&self) -> MetricsResult<Arc<MetricSnapshot>> {
        self.core.state.with(|state| Arc::new(self.core.build(state)))
    }

    fn publish(&self) -> MetricsResult<Arc<MetricSnapshot>> {
        self.core.state.with(|state| self.core.push(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::test_context;
    use crate::aggregator::ThroughputAggregator;
    use crate::config::MetricsConfig;
    use std::time::Duration;

    fn transfer(snapshot: &MetricSnapshot) -> DataTransmissionSnapshot {
        snapshot.as_data_transmission().unwrap().clone()
    }

    #[test]
    fn test_totals_accumulate() {
        let aggregator = DataTransmissionAggregator::new(test_context(MetricsConfig::default()));
        aggregator.record_sent(100).unwrap();
        aggregator.record_sent(50).unwrap();
        aggregator.record_received(1_000).unwrap();

        let s = transfer(&aggregator.snapshot().unwrap());
        assert_eq!(s.total_bytes_sent, 150);
        assert_eq!(s.total_bytes_received, 1_000);
        // No completed requests known yet
        assert_eq!(s.average_bytes_sent, 0.0);
    }

    #[test]
    fn test_rates_use_elapsed_floor() {
        let aggregator = DataTransmissionAggregator::new(test_context(MetricsConfig::default()));
        aggregator.record_sent(1_000).unwrap();
        aggregator.record_received(3_000).unwrap();

        // Never started: elapsed is zero and the 100 ms floor applies
        let s = transfer(&aggregator.snapshot().unwrap());
        assert_eq!(s.upstream_bytes_per_second, 10_000.0);
        assert_eq!(s.downstream_bytes_per_second, 30_000.0);
        assert_eq!(s.total_bytes_per_second, 40_000.0);
    }

    #[test]
    fn test_averages_follow_completed_requests() {
        let ctx = test_context(MetricsConfig::default());
        let throughput = ThroughputAggregator::new(ctx.clone());
        let aggregator = DataTransmissionAggregator::new(ctx);
        aggregator.start().unwrap();

        for _ in 0..4 {
            throughput.request_started().unwrap();
            aggregator.record_sent(256).unwrap();
            aggregator.record_received(1_024).unwrap();
            throughput.request_completed(true).unwrap();
        }
        aggregator.tick();

        let s = transfer(&aggregator.snapshot().unwrap());
        assert_eq!(s.average_bytes_sent, 256.0);
        assert_eq!(s.average_bytes_received, 1_024.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rates_over_active_time() {
        let aggregator = DataTransmissionAggregator::new(test_context(MetricsConfig::default()));
        aggregator.start().unwrap();
        aggregator.record_sent(4_000).unwrap();
        aggregator.record_received(8_000).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        aggregator.stop().unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        let s = transfer(&aggregator.snapshot().unwrap());
        assert_eq!(s.elapsed_active_ms, 4_000);
        assert_eq!(s.upstream_bytes_per_second, 1_000.0);
        assert_eq!(s.downstream_bytes_per_second, 2_000.0);
        assert_eq!(s.total_bytes_per_second, 3_000.0);
    }
}

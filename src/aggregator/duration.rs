use super::{AggregatorContext, GuardedState, MetricAggregator};
use crate::{
    error::MetricsResult,
    events::MetricEvent,
    histogram::PercentileHistogram,
    iteration::IterationIdentity,
    snapshot::{ComponentSummary, DurationSnapshot, MetricKind, MetricSnapshot, TimingComponent},
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Running statistics for one timing component
#[derive(Debug)]
struct ComponentStats {
    count: u64,
    sum: u64,
    min: Option<u64>,
    max: u64,
    histogram: PercentileHistogram,
}

impl ComponentStats {
    fn new(ctx: &AggregatorContext) -> MetricsResult<Self> {
        Ok(Self {
            count: 0,
            sum: 0,
            min: None,
            max: 0,
            histogram: PercentileHistogram::new(
                ctx.config.histogram_highest_ms,
                ctx.config.histogram_significant_figures,
            )?,
        })
    }

    fn record(&mut self, millis: u64) -> MetricsResult<()> {
        // The histogram clamps; min/max/sum keep the exact value
        self.histogram.record(millis)?;
        self.count += 1;
        self.sum = self.sum.saturating_add(millis);
        self.min = Some(self.min.map_or(millis, |min| min.min(millis)));
        self.max = self.max.max(millis);
        Ok(())
    }

    fn summary(&self) -> ComponentSummary {
        if self.count == 0 {
            return ComponentSummary::default();
        }

        let min = self.min.unwrap_or_default();
        let readings = self.histogram.readings();
        let bound = |value: u64| value.clamp(min, self.max);

        ComponentSummary {
            count: self.count,
            sum_ms: self.sum,
            min_ms: min,
            max_ms: self.max,
            average_ms: self.sum as f64 / self.count as f64,
            p50_ms: bound(readings.p50),
            p90_ms: bound(readings.p90),
            p95_ms: bound(readings.p95),
            p99_ms: bound(readings.p99),
        }
    }
}

#[derive(Debug)]
struct DurationState {
    components: Vec<ComponentStats>,
    summaries: BTreeMap<TimingComponent, ComponentSummary>,
}

/// Latency statistics for the seven timing components of a request.
///
/// Publishes after every sample. Only the component that changed is
/// re-summarized; the other six summaries are reused.
#[derive(Debug)]
pub struct DurationAggregator {
    ctx: AggregatorContext,
    state: GuardedState<DurationState>,
    running: AtomicBool,
}

impl DurationAggregator {
    pub fn new(ctx: AggregatorContext) -> MetricsResult<Self> {
        let components = TimingComponent::ALL
            .iter()
            .map(|_| ComponentStats::new(&ctx))
            .collect::<MetricsResult<Vec<_>>>()?;
        let summaries = TimingComponent::ALL
            .into_iter()
            .map(|component| (component, ComponentSummary::default()))
            .collect();

        let state = GuardedState::new(
            MetricKind::Duration,
            &ctx,
            DurationState {
                components,
                summaries,
            },
        );

        Ok(Self {
            ctx,
            state,
            running: AtomicBool::new(false),
        })
    }

    /// Record one sample, in whole milliseconds
    pub fn record_sample(&self, component: TimingComponent, millis: u64) -> MetricsResult<()> {
        self.state.try_with(|state| {
            let stats = &mut state.components[component.index()];
            stats.record(millis)?;
            state.summaries.insert(component, stats.summary());
            self.push(state);
            Ok(())
        })
    }

    pub fn record_duration(&self, component: TimingComponent, duration: Duration) -> MetricsResult<()> {
        self.record_sample(component, duration.as_millis() as u64)
    }

    /// Record a sample for a component given by name.
    ///
    /// An unknown name is logged and the sample dropped; this is not an error
    /// for the caller.
    pub fn record_named_sample(&self, component: &str, millis: u64) -> MetricsResult<()> {
        match component.parse::<TimingComponent>() {
            Ok(component) => self.record_sample(component, millis),
            Err(e) => {
                warn!(
                    "Dropping duration sample for {}: {}",
                    self.ctx.identity.label(),
                    e
                );
                Ok(())
            }
        }
    }

    fn build(&self, state: &DurationState) -> MetricSnapshot {
        MetricSnapshot::Duration(DurationSnapshot {
            identity: Arc::clone(&self.ctx.identity),
            timestamp: Utc::now(),
            components: state.summaries.clone(),
        })
    }

    fn push(&self, state: &DurationState) -> Arc<MetricSnapshot> {
        self.ctx.store.push(self.build(state))
    }
}

impl MetricAggregator for DurationAggregator {
    fn kind(&self) -> MetricKind {
        MetricKind::Duration
    }

    fn identity(&self) -> &Arc<IterationIdentity> {
        &self.ctx.identity
    }

    fn update(&self, event: &MetricEvent) -> MetricsResult<()> {
        match event {
            MetricEvent::Timing { component, millis } => self.record_sample(*component, *millis),
            other => Err(self.ctx.unsupported(self.kind(), other)),
        }
    }

    fn start(&self) -> MetricsResult<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> MetricsResult<()> {
        self.running.store(false, Ordering::Release);
        self.publish()?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> MetricsResult<Arc<MetricSnapshot>> {
        self.state.with(|state| Arc::new(self.build(state)))
    }

    fn publish(&self) -> MetricsResult<Arc<MetricSnapshot>> {
        self.state.with(|state| self.push(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::test_context;
    use crate::config::MetricsConfig;

    fn aggregator() -> DurationAggregator {
        DurationAggregator::new(test_context(MetricsConfig::default())).unwrap()
    }

    fn total(aggregator: &DurationAggregator) -> ComponentSummary {
        aggregator
            .snapshot()
            .unwrap()
            .as_duration()
            .unwrap()
            .component(TimingComponent::Total)
    }

    #[test]
    fn test_statistics_of_five_samples() {
        let aggregator = aggregator();
        for millis in [100, 200, 300, 400, 500] {
            aggregator.record_sample(TimingComponent::Total, millis).unwrap();
        }

        let summary = total(&aggregator);
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min_ms, 100);
        assert_eq!(summary.max_ms, 500);
        assert_eq!(summary.sum_ms, 1500);
        assert_eq!(summary.average_ms, 300.0);
        assert_eq!(summary.p50_ms, 300);
    }

    #[test]
    fn test_first_sample_initializes_min() {
        let aggregator = aggregator();
        aggregator.record_sample(TimingComponent::Waiting, 750).unwrap();

        let snapshot = aggregator.snapshot().unwrap();
        let waiting = snapshot.as_duration().unwrap().component(TimingComponent::Waiting);
        assert_eq!(waiting.min_ms, 750);
        assert_eq!(waiting.max_ms, 750);
        assert_eq!(waiting.p99_ms, 750);
    }

    #[test]
    fn test_percentiles_bounded_by_min_and_max() {
        let aggregator = aggregator();
        for millis in [3, 17, 250, 251, 999, 4_000, 65_537] {
            aggregator.record_sample(TimingComponent::Total, millis).unwrap();
        }

        let summary = total(&aggregator);
        for p in [summary.p50_ms, summary.p90_ms, summary.p95_ms, summary.p99_ms] {
            assert!(summary.min_ms <= p && p <= summary.max_ms);
        }
        assert_eq!(summary.min_ms, 3);
        assert_eq!(summary.max_ms, 65_537);
    }

    #[test]
    fn test_samples_above_histogram_bound_keep_exact_max() {
        let config = MetricsConfig {
            histogram_highest_ms: 1_000,
            ..Default::default()
        };
        let aggregator = DurationAggregator::new(test_context(config)).unwrap();
        aggregator.record_sample(TimingComponent::Total, 10).unwrap();
        aggregator.record_sample(TimingComponent::Total, 5_000).unwrap();

        let summary = total(&aggregator);
        assert_eq!(summary.max_ms, 5_000);
        assert_eq!(summary.sum_ms, 5_010);
        assert!(summary.p99_ms <= summary.max_ms);
    }

    #[test]
    fn test_every_sample_publishes_all_components() {
        let ctx = test_context(MetricsConfig::default());
        let store = Arc::clone(&ctx.store);
        let id = ctx.iteration_id();
        let aggregator = DurationAggregator::new(ctx).unwrap();

        aggregator.record_sample(TimingComponent::TcpHandshake, 12).unwrap();
        aggregator.record_sample(TimingComponent::Receiving, 4).unwrap();

        assert_eq!(store.history_len(id, MetricKind::Duration), 2);
        let latest = store.latest(id, MetricKind::Duration).unwrap();
        let duration = latest.as_duration().unwrap();
        assert_eq!(duration.components.len(), TimingComponent::ALL.len());
        assert_eq!(duration.component(TimingComponent::TcpHandshake).count, 1);
        assert_eq!(duration.component(TimingComponent::Receiving).sum_ms, 4);
        assert_eq!(duration.component(TimingComponent::Sending).count, 0);
    }

    #[test]
    fn test_unknown_component_name_leaves_state_valid() {
        let aggregator = aggregator();
        aggregator.record_named_sample("dns", 10).unwrap();
        aggregator.record_named_sample("total", 10).unwrap();

        assert_eq!(total(&aggregator).count, 1);
    }

    #[test]
    fn test_stop_and_start_keep_statistics() {
        let aggregator = aggregator();
        aggregator.start().unwrap();
        aggregator.record_sample(TimingComponent::Total, 40).unwrap();
        aggregator.stop().unwrap();
        assert!(!aggregator.is_running());

        aggregator.start().unwrap();
        aggregator.record_sample(TimingComponent::Total, 60).unwrap();

        let summary = total(&aggregator);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.average_ms, 50.0);
    }

    #[test]
    fn test_concurrent_samples_are_all_counted() {
        let aggregator = Arc::new(aggregator());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        aggregator
                            .record_sample(TimingComponent::Total, worker * 1000 + i)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let summary = total(&aggregator);
        assert_eq!(summary.count, 2000);
        assert_eq!(summary.min_ms, 0);
        assert_eq!(summary.max_ms, 7249);
    }
}

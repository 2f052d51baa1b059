//! Request counters, request rates and error rate for one iteration.
//!
//! `request_completed(success)` only knows whether a response came back.
//! Whether that response counts as a failure depends on its status code,
//! which arrives separately at the response-code aggregator. The periodic
//! recompute reads the response-code aggregator's latest snapshot and
//! reclassifies completed requests against the iteration's failure codes:
//!
//! ```text
//! failed     = transport failures + min(failure-coded responses, transport successes)
//! successful = completed - failed
//! ```
//!
//! So between ticks `successful` may briefly include requests that a later
//! tick moves into `failed`. `active = started - successful - failed` holds
//! at every publish regardless.

use super::{AggregatorContext, GuardedState, MetricAggregator, Tick, Ticker};
use crate::{
    error::MetricsResult,
    events::MetricEvent,
    iteration::IterationIdentity,
    rate::{error_rate, ActiveClock, RateCalculator},
    snapshot::{MetricKind, MetricSnapshot, ThroughputSnapshot},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct ThroughputState {
    clock: ActiveClock,
    started: u64,
    active: u64,
    completed: u64,
    transport_failed: u64,
    /// Failure-coded responses as of the last recompute
    status_failed: u64,
    orphan_completions: u64,
}

impl ThroughputState {
    fn failed(&self) -> u64 {
        let transport_ok = self.completed - self.transport_failed;
        self.transport_failed + self.status_failed.min(transport_ok)
    }
}

#[derive(Debug)]
struct ThroughputCore {
    ctx: AggregatorContext,
    rates: RateCalculator,
    state: GuardedState<ThroughputState>,
}

impl ThroughputCore {
    fn build(&self, state: &ThroughputState) -> MetricSnapshot {
        let elapsed = state.clock.elapsed();
        let failed = state.failed();
        let successful = state.completed - failed;

        MetricSnapshot::Throughput(ThroughputSnapshot {
            identity: Arc::clone(&self.ctx.identity),
            timestamp: Utc::now(),
            requests_count: state.started,
            active_requests: state.active,
            successful_requests: successful,
            failed_requests: failed,
            elapsed_active_ms: elapsed.as_millis() as u64,
            requests_rate: self.rates.requests_rate(successful, elapsed),
            cooldown_requests_rate: self
                .rates
                .cooldown_rate(successful, elapsed, &self.ctx.settings),
            error_rate: error_rate(failed, state.completed),
        })
    }

    fn push(&self, state: &ThroughputState) -> Arc<MetricSnapshot> {
        self.ctx.store.push(self.build(state))
    }

    /// Failure-coded responses according to the response-code aggregator
    fn failure_coded_responses(&self) -> Option<u64> {
        let latest = self
            .ctx
            .store
            .latest(self.ctx.iteration_id(), MetricKind::ResponseCode)?;
        match latest.as_response_code() {
            Ok(codes) => Some(codes.count_where(|code| self.ctx.settings.is_failure(code))),
            Err(e) => {
                warn!("Ignoring response codes for {}: {}", self.ctx.identity.label(), e);
                None
            }
        }
    }

    /// Reclassify completions and publish. Skipped while stopped unless forced.
    fn recompute(&self, force: bool) -> MetricsResult<Option<Arc<MetricSnapshot>>> {
        // Read outside our lock; aggregators never hold each other's locks
        let status_failed = self.failure_coded_responses();

        self.state.with(|state| {
            if !force && !state.clock.is_running() {
                return None;
            }
            if let Some(count) = status_failed {
                state.status_failed = state.status_failed.max(count);
            }
            Some(self.push(state))
        })
    }
}

impl Tick for ThroughputCore {
    fn tick(&self) {
        match self.recompute(false) {
            Ok(Some(_)) => trace!("Recomputed throughput for {}", self.ctx.identity.label()),
            Ok(None) => {}
            Err(e) => warn!(
                "Skipped throughput recompute for {}: {}",
                self.ctx.identity.label(),
                e
            ),
        }
    }
}

/// Counts requests in flight, completed and failed, and derives their rates.
#[derive(Debug)]
pub struct ThroughputAggregator {
    core: Arc<ThroughputCore>,
    ticker: Ticker,
}

impl ThroughputAggregator {
    pub fn new(ctx: AggregatorContext) -> Self {
        let ticker = Ticker::new(
            format!("throughput of {}", ctx.identity.label()),
            ctx.config.tick_interval,
        );
        let core = ThroughputCore {
            rates: RateCalculator::new(ctx.config.rate_window),
            state: GuardedState::new(MetricKind::Throughput, &ctx, ThroughputState::default()),
            ctx,
        };

        Self {
            core: Arc::new(core),
            ticker,
        }
    }

    pub fn request_started(&self) -> MetricsResult<()> {
        self.core.state.with(|state| {
            state.started += 1;
            state.active += 1;
            self.core.push(state);
        })
    }

    /// A request finished. `success` is transport-level: a response arrived.
    ///
    /// A completion with nothing in flight is logged and dropped.
    pub fn request_completed(&self, success: bool) -> MetricsResult<()> {
        self.core.state.with(|state| {
            if state.active == 0 {
                state.orphan_completions += 1;
                warn!(
                    "Ignoring completion with no active request for {} ({} so far)",
                    self.core.ctx.identity.label(),
                    state.orphan_completions
                );
                return;
            }

            state.active -= 1;
            state.completed += 1;
            if !success {
                state.transport_failed += 1;
            }
            self.core.push(state);
        })
    }

    /// Recompute rates and the success/failure split now, as a timer tick would
    pub fn tick(&self) {
        self.core.tick();
    }

    /// Completions that arrived with no active request
    pub fn orphan_completions(&self) -> MetricsResult<u64> {
        self.core.state.with(|state| state.orphan_completions)
    }
}

impl MetricAggregator for ThroughputAggregator {
    fn kind(&self) -> MetricKind {
        MetricKind::Throughput
    }

    fn identity(&self) -> &Arc<IterationIdentity> {
        &self.core.ctx.identity
    }

    fn update(&self, event: &MetricEvent) -> MetricsResult<()> {
        match event {
            MetricEvent::RequestStarted => self.request_started(),
            MetricEvent::RequestCompleted { success } => self.request_completed(*success),
            other => Err(self.core.ctx.unsupported(self.kind(), other)),
        }
    }

    /// Resume the active clock and the recompute timer. Counters are kept.
    fn start(&self) -> MetricsResult<()> {
        self.core.state.with(|state| state.clock.start())?;
        self.ticker.start(Arc::clone(&self.core));
        Ok(())
    }

    /// Stop the timer first, then pause the clock and publish once.
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
    use crate::aggregator::tests::{test_context, test_context_with};
    use crate::aggregator::ResponseCodeAggregator;
    use crate::config::MetricsConfig;
    use crate::iteration::{ExecutionMode, IterationSettings};
    use std::time::Duration;

    fn throughput(snapshot: &MetricSnapshot) -> ThroughputSnapshot {
        snapshot.as_throughput().unwrap().clone()
    }

    fn assert_active_balance(s: &ThroughputSnapshot) {
        assert_eq!(
            s.active_requests,
            s.requests_count - s.successful_requests - s.failed_requests
        );
    }

    #[test]
    fn test_counters_track_started_and_completed() {
        let aggregator = ThroughputAggregator::new(test_context(MetricsConfig::default()));

        for _ in 0..3 {
            aggregator.request_started().unwrap();
        }
        aggregator.request_completed(true).unwrap();
        aggregator.request_completed(false).unwrap();

        let s = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(s.requests_count, 3);
        assert_eq!(s.active_requests, 1);
        assert_eq!(s.successful_requests, 1);
        assert_eq!(s.failed_requests, 1);
        assert_eq!(s.error_rate, 0.5);
        assert_active_balance(&s);
    }

    #[test]
    fn test_completion_without_active_request_is_dropped() {
        let aggregator = ThroughputAggregator::new(test_context(MetricsConfig::default()));

        aggregator.request_completed(true).unwrap();
        aggregator.request_started().unwrap();
        aggregator.request_completed(true).unwrap();
        aggregator.request_completed(false).unwrap();

        let s = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(s.active_requests, 0);
        assert_eq!(s.completed_requests(), 1);
        assert_eq!(aggregator.orphan_completions().unwrap(), 2);
        assert_active_balance(&s);
    }

    #[test]
    fn test_tick_reclassifies_failure_codes() {
        let ctx = test_context(MetricsConfig::default());
        let codes = ResponseCodeAggregator::new(ctx.clone());
        let aggregator = ThroughputAggregator::new(ctx);
        aggregator.start().unwrap();

        for _ in 0..10 {
            aggregator.request_started().unwrap();
        }
        for i in 0..10 {
            if i < 8 {
                codes.record_response(200, "OK").unwrap();
            } else {
                codes.record_response(500, "Internal Server Error").unwrap();
            }
            aggregator.request_completed(true).unwrap();
        }

        // Before the recompute every transport success counts as successful
        let before = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(before.successful_requests, 10);

        aggregator.tick();
        let after = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(after.failed_requests, 2);
        assert_eq!(after.successful_requests, 8);
        assert_eq!(after.error_rate, 0.2);
        assert_active_balance(&after);
    }

    #[test]
    fn test_only_successful_count_moves_backwards() {
        let ctx = test_context(MetricsConfig::default());
        let codes = ResponseCodeAggregator::new(ctx.clone());
        let aggregator = ThroughputAggregator::new(ctx.clone());
        aggregator.start().unwrap();

        for round in 0..3 {
            for i in 0..10 {
                aggregator.request_started().unwrap();
                if i < 7 {
                    codes.record_response(200, "OK").unwrap();
                } else {
                    codes.record_response(502, "Bad Gateway").unwrap();
                }
                aggregator.request_completed(true).unwrap();
            }
            if round < 2 {
                aggregator.tick();
            }
        }
        aggregator.stop().unwrap();

        let history: Vec<ThroughputSnapshot> = ctx
            .store
            .history(ctx.iteration_id(), MetricKind::Throughput)
            .iter()
            .map(|s| throughput(s))
            .collect();
        let mut successful_dropped = false;
        for pair in history.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            assert!(later.requests_count >= earlier.requests_count);
            assert!(later.completed_requests() >= earlier.completed_requests());
            assert!(later.failed_requests >= earlier.failed_requests);
            successful_dropped |= later.successful_requests < earlier.successful_requests;
            assert_active_balance(later);
        }
        assert!(successful_dropped);

        let last = history.last().unwrap();
        assert_eq!(last.failed_requests, 9);
        assert_eq!(last.successful_requests, 21);
    }

    #[test]
    fn test_failure_codes_never_exceed_transport_successes() {
        let ctx = test_context(MetricsConfig::default());
        let codes = ResponseCodeAggregator::new(ctx.clone());
        let aggregator = ThroughputAggregator::new(ctx);
        aggregator.start().unwrap();

        // Response events can run ahead of completion events
        for _ in 0..5 {
            codes.record_response(503, "Service Unavailable").unwrap();
        }
        for _ in 0..3 {
            aggregator.request_started().unwrap();
        }
        aggregator.request_completed(true).unwrap();
        aggregator.tick();

        let s = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(s.failed_requests, 1);
        assert_eq!(s.successful_requests, 0);
        assert_eq!(s.active_requests, 2);
        assert_active_balance(&s);
    }

    #[test]
    fn test_tick_is_skipped_while_stopped() {
        let ctx = test_context(MetricsConfig::default());
        let store = Arc::clone(&ctx.store);
        let id = ctx.iteration_id();
        let aggregator = ThroughputAggregator::new(ctx);

        aggregator.tick();
        assert_eq!(store.history_len(id, MetricKind::Throughput), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_then_single_request_has_finite_rate() {
        let aggregator = ThroughputAggregator::new(test_context(MetricsConfig::default()));
        aggregator.start().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let idle = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(idle.requests_rate.value, 0.0);

        aggregator.request_started().unwrap();
        aggregator.request_completed(true).unwrap();
        aggregator.tick();

        let s = throughput(&aggregator.snapshot().unwrap());
        assert!(s.requests_rate.value.is_finite());
        assert!(s.requests_rate.value > 0.0);
        assert!((s.requests_rate.value - 0.5).abs() < 1e-6);
        assert_eq!(s.requests_rate.window_ms, 1000);
        aggregator.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_publishes_while_running() {
        let ctx = test_context(MetricsConfig::default());
        let store = Arc::clone(&ctx.store);
        let id = ctx.iteration_id();
        let aggregator = ThroughputAggregator::new(ctx);

        aggregator.start().unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(store.history_len(id, MetricKind::Throughput), 3);

        // stop publishes exactly once more and silences the timer
        aggregator.stop().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.history_len(id, MetricKind::Throughput), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_start_resume_elapsed_clock() {
        let aggregator = ThroughputAggregator::new(test_context(MetricsConfig::default()));
        aggregator.start().unwrap();
        aggregator.request_started().unwrap();
        aggregator.request_completed(true).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        aggregator.stop().unwrap();
        assert!(!aggregator.is_running());
        let paused = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(paused.elapsed_active_ms, 2000);

        // Time spent stopped does not count
        tokio::time::sleep(Duration::from_secs(10)).await;
        aggregator.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        aggregator.request_started().unwrap();

        let resumed = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(resumed.elapsed_active_ms, 3000);
        assert_eq!(resumed.requests_count, 2);
        assert_eq!(resumed.successful_requests, 1);
        assert_eq!(resumed.active_requests, 1);
        aggregator.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_rate_for_batch_mode() {
        let settings = IterationSettings {
            mode: ExecutionMode::CooldownBatch,
            cooldown: Duration::from_secs(5),
            ..Default::default()
        };
        let aggregator =
            ThroughputAggregator::new(test_context_with(MetricsConfig::default(), settings));
        aggregator.start().unwrap();

        for _ in 0..100 {
            aggregator.request_started().unwrap();
            aggregator.request_completed(true).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        let early = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(early.cooldown_requests_rate.unwrap().value, 0.0);

        tokio::time::sleep(Duration::from_secs(17)).await;
        let s = throughput(&aggregator.snapshot().unwrap());
        let cooldown = s.cooldown_requests_rate.unwrap();
        assert!((cooldown.value - 25.0).abs() < 1e-6);
        assert_eq!(cooldown.window_ms, 5000);
        assert!((s.requests_rate.value - 5.0).abs() < 1e-6);
        aggregator.stop().unwrap();
    }

    #[test]
    fn test_no_cooldown_rate_for_continuous_mode() {
        let aggregator = ThroughputAggregator::new(test_context(MetricsConfig::default()));
        let s = throughput(&aggregator.snapshot().unwrap());
        assert!(s.cooldown_requests_rate.is_none());
    }

    #[test]
    fn test_concurrent_updates_keep_active_balanced() {
        let aggregator = Arc::new(ThroughputAggregator::new(test_context(
            MetricsConfig::default(),
        )));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        aggregator.request_started().unwrap();
                        aggregator.request_completed((i + worker) % 10 != 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let s = throughput(&aggregator.snapshot().unwrap());
        assert_eq!(s.requests_count, 4000);
        assert_eq!(s.active_requests, 0);
        assert_eq!(s.failed_requests, 400);
        assert_active_balance(&s);
    }
}

use super::{AggregatorContext, GuardedState, MetricAggregator};
use crate::{
    error::MetricsResult,
    events::MetricEvent,
    iteration::IterationIdentity,
    snapshot::{MetricKind, MetricSnapshot, ResponseCodeCount, ResponseCodeSnapshot},
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Occurrence counts per (status code, reason phrase).
///
/// A test run sees a handful of distinct pairs, so lookup is a linear scan
/// under the lock.
#[derive(Debug)]
pub struct ResponseCodeAggregator {
    ctx: AggregatorContext,
    state: GuardedState<Vec<ResponseCodeCount>>,
    running: AtomicBool,
}

impl ResponseCodeAggregator {
    pub fn new(ctx: AggregatorContext) -> Self {
        let state = GuardedState::new(MetricKind::ResponseCode, &ctx, Vec::new());
        Self {
            ctx,
            state,
            running: AtomicBool::new(false),
        }
    }

    pub fn record_response(&self, status_code: u16, reason: &str) -> MetricsResult<()> {
        self.state.with(|responses| {
            match responses
                .iter_mut()
                .find(|r| r.status_code == status_code && r.reason == reason)
            {
                Some(existing) => existing.count += 1,
                None => responses.push(ResponseCodeCount {
                    status_code,
                    reason: reason.to_string(),
                    count: 1,
                }),
            }
            self.push(responses);
        })
    }

    fn build(&self, responses: &[ResponseCodeCount]) -> MetricSnapshot {
        MetricSnapshot::ResponseCode(ResponseCodeSnapshot {
            identity: Arc::clone(&self.ctx.identity),
            timestamp: Utc::now(),
            responses: responses.to_vec(),
        })
    }

    fn push(&self, responses: &[ResponseCodeCount]) -> Arc<MetricSnapshot> {
        self.ctx.store.push(self.build(responses))
    }
}

impl MetricAggregator for ResponseCodeAggregator {
    fn kind(&self) -> MetricKind {
        MetricKind::ResponseCode
    }

    fn identity(&self) -> &Arc<IterationIdentity> {
        &self.ctx.identity
    }

    fn update(&self, event: &MetricEvent) -> MetricsResult<()> {
        match event {
            MetricEvent::Response {
                status_code,
                reason,
            } => self.record_response(*status_code, reason),
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
        self.state.with(|responses| Arc::new(self.build(responses)))
    }

    fn publish(&self) -> MetricsResult<Arc<MetricSnapshot>> {
        self.state.with(|responses| self.push(responses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::test_context;
    use crate::config::MetricsConfig;

    #[test]
    fn test_buckets_by_code_and_reason() {
        let aggregator = ResponseCodeAggregator::new(test_context(MetricsConfig::default()));
        for _ in 0..8 {
            aggregator.record_response(200, "OK").unwrap();
        }
        for _ in 0..2 {
            aggregator.record_response(500, "Internal Server Error").unwrap();
        }

        let snapshot = aggregator.snapshot().unwrap();
        let codes = snapshot.as_response_code().unwrap();
        assert_eq!(codes.responses.len(), 2);
        assert_eq!(codes.count_of(200, "OK"), 8);
        assert_eq!(codes.count_of(500, "Internal Server Error"), 2);
    }

    #[test]
    fn test_same_code_with_different_reason_is_separate() {
        let aggregator = ResponseCodeAggregator::new(test_context(MetricsConfig::default()));
        aggregator.record_response(200, "OK").unwrap();
        aggregator.record_response(200, "Fine").unwrap();
        aggregator.record_response(200, "OK").unwrap();

        let snapshot = aggregator.snapshot().unwrap();
        let codes = snapshot.as_response_code().unwrap();
        assert_eq!(codes.responses.len(), 2);
        assert_eq!(codes.count_of(200, "OK"), 2);
        assert_eq!(codes.count_of(200, "Fine"), 1);
    }

    #[test]
    fn test_published_snapshot_is_not_changed_by_later_updates() {
        let ctx = test_context(MetricsConfig::default());
        let store = Arc::clone(&ctx.store);
        let id = ctx.iteration_id();
        let aggregator = ResponseCodeAggregator::new(ctx);

        aggregator.record_response(404, "Not Found").unwrap();
        let first = store.latest(id, MetricKind::ResponseCode).unwrap();
        aggregator.record_response(404, "Not Found").unwrap();

        assert_eq!(first.as_response_code().unwrap().total(), 1);
        let latest = store.latest(id, MetricKind::ResponseCode).unwrap();
        assert_eq!(latest.as_response_code().unwrap().total(), 2);
    }

    #[test]
    fn test_no_lost_updates_under_concurrency() {
        let aggregator = Arc::new(ResponseCodeAggregator::new(test_context(
            MetricsConfig::default(),
        )));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    let (code, reason) = if worker % 2 == 0 {
                        (200, "OK")
                    } else {
                        (502, "Bad Gateway")
                    };
                    for _ in 0..500 {
                        aggregator.record_response(code, reason).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = aggregator.snapshot().unwrap();
        let codes = snapshot.as_response_code().unwrap();
        assert_eq!(codes.count_of(200, "OK"), 2000);
        assert_eq!(codes.count_of(502, "Bad Gateway"), 2000);
        assert_eq!(codes.total(), 4000);
    }
}

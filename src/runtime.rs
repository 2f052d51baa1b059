use crate::{
    aggregator::AggregatorSet,
    config::MetricsConfig,
    error::MetricsResult,
    events::MetricsRecorder,
    factory::AggregatorFactory,
    iteration::{Iteration, IterationId},
    query::MetricsQueryService,
    store::MetricDataStore,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything one test run needs to collect and read live metrics.
///
/// Cloning is cheap and every clone shares the same store and aggregators.
#[derive(Debug, Clone)]
pub struct MetricsRuntime {
    config: MetricsConfig,
    store: Arc<MetricDataStore>,
    factory: Arc<AggregatorFactory>,
    query: MetricsQueryService,
    recorder: MetricsRecorder,
}

impl MetricsRuntime {
    pub fn new(config: MetricsConfig) -> MetricsResult<Self> {
        config.validate()?;

        let store = Arc::new(MetricDataStore::new(config.history_capacity));
        let factory = Arc::new(AggregatorFactory::new(Arc::clone(&store), config.clone()));
        let query = MetricsQueryService::new(Arc::clone(&store), Arc::clone(&factory));
        let recorder = MetricsRecorder::new(Arc::clone(&factory));

        debug!("Metrics runtime created with {:?}", config);
        Ok(Self {
            config,
            store,
            factory,
            query,
            recorder,
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetricDataStore> {
        &self.store
    }

    pub fn factory(&self) -> &Arc<AggregatorFactory> {
        &self.factory
    }

    pub fn query(&self) -> &MetricsQueryService {
        &self.query
    }

    pub fn recorder(&self) -> &MetricsRecorder {
        &self.recorder
    }

    /// Register an iteration and start its aggregators
    pub fn monitor(&self, iteration: &Iteration, round_name: &str) -> MetricsResult<Arc<AggregatorSet>> {
        let set = self.factory.get_or_create(iteration, round_name)?;
        set.start_all()?;
        Ok(set)
    }

    /// Stop monitoring an iteration, optionally dropping its stored history
    pub fn unmonitor(&self, iteration: IterationId, drop_history: bool) -> bool {
        let removed = self.factory.remove(iteration).is_some();
        if drop_history {
            self.store.remove(iteration);
        }
        removed
    }

    /// Stop every aggregator with a final publish. Stored history is kept
    /// so a report can still be written afterwards.
    pub fn shutdown(&self) -> usize {
        let stopped = self.factory.clear();
        info!("Metrics runtime shut down, {} iterations stopped", stopped);
        stopped
    }
}

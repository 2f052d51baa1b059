//! Read-only façade over the snapshot store for dashboards and exporters.
//!
//! Nothing here takes an aggregator lock. Reads see whatever was last
//! published, and an iteration that was never monitored reads as empty
//! rather than as an error.

use crate::{
    factory::AggregatorFactory,
    iteration::{IterationId, IterationIdentity},
    snapshot::{KindedSnapshot, MetricKind, MetricSnapshot},
    store::MetricDataStore,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The latest snapshot of each kind for one iteration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationMetrics {
    pub duration: Option<Arc<MetricSnapshot>>,
    pub throughput: Option<Arc<MetricSnapshot>>,
    pub response_code: Option<Arc<MetricSnapshot>>,
    pub data_transmission: Option<Arc<MetricSnapshot>>,
}

impl IterationMetrics {
    pub fn get(&self, kind: MetricKind) -> Option<&Arc<MetricSnapshot>> {
        match kind {
            MetricKind::Duration => self.duration.as_ref(),
            MetricKind::Throughput => self.throughput.as_ref(),
            MetricKind::ResponseCode => self.response_code.as_ref(),
            MetricKind::DataTransmission => self.data_transmission.as_ref(),
        }
        .filter(|snapshot| snapshot.kind() == kind)
    }

    pub fn is_empty(&self) -> bool {
        MetricKind::ALL.iter().all(|kind| self.get(*kind).is_none())
    }

    /// Every present snapshot flattened and merged into one map.
    ///
    /// Keys are prefixed with the metric kind, e.g.
    /// `throughput.requests_rate.value`.
    pub fn flat(&self) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for kind in MetricKind::ALL {
            if let Some(snapshot) = self.get(kind) {
                for (key, value) in snapshot.flat_or_empty() {
                    merged.insert(format!("{}.{}", kind, key), value);
                }
            }
        }
        merged
    }
}

#[derive(Debug, Clone)]
pub struct MetricsQueryService {
    store: Arc<MetricDataStore>,
    factory: Arc<AggregatorFactory>,
}

impl MetricsQueryService {
    pub fn new(store: Arc<MetricDataStore>, factory: Arc<AggregatorFactory>) -> Self {
        Self { store, factory }
    }

    pub fn latest(&self, iteration: IterationId, kind: MetricKind) -> Option<Arc<MetricSnapshot>> {
        self.store.latest(iteration, kind)
    }

    /// Latest snapshot of a statically known kind.
    ///
    /// Returns `None` when nothing has been published or, which only a bug
    /// could cause, when the stored snapshot is of another kind.
    pub fn latest_of<T: KindedSnapshot + Clone>(&self, iteration: IterationId) -> Option<T> {
        let snapshot = self.store.latest(iteration, T::KIND)?;
        T::from_snapshot(&snapshot).ok().cloned()
    }

    /// Point-in-time history, oldest first
    pub fn history(&self, iteration: IterationId, kind: MetricKind) -> Vec<Arc<MetricSnapshot>> {
        self.store.history(iteration, kind)
    }

    pub fn all_latest(&self, iteration: IterationId) -> IterationMetrics {
        IterationMetrics {
            duration: self.store.latest(iteration, MetricKind::Duration),
            throughput: self.store.latest(iteration, MetricKind::Throughput),
            response_code: self.store.latest(iteration, MetricKind::ResponseCode),
            data_transmission: self.store.latest(iteration, MetricKind::DataTransmission),
        }
    }

    pub fn monitored_iterations(&self) -> Vec<Arc<IterationIdentity>> {
        self.factory.monitored_iterations()
    }

    /// Flattened view of everything known about an iteration
    pub fn flat(&self, iteration: IterationId) -> BTreeMap<String, Value> {
        self.all_latest(iteration).flat()
    }
}

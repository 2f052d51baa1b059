//! # Aggregator Factory
//!
//! Creates the four aggregators of an iteration exactly once and keeps them
//! for the iteration's monitored lifetime. It is also the registry exporters
//! poll for the set of monitored iterations.
//!
//! The factory is owned by a run context ([`MetricsRuntime`](crate::MetricsRuntime))
//! rather than living in a global, so independent runs (and tests) never
//! share aggregators.

use crate::{
    aggregator::{AggregatorContext, AggregatorSet},
    config::MetricsConfig,
    error::MetricsResult,
    iteration::{Iteration, IterationId, IterationIdentity},
    store::MetricDataStore,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct AggregatorFactory {
    store: Arc<MetricDataStore>,
    config: Arc<MetricsConfig>,
    sets: DashMap<IterationId, Arc<AggregatorSet>>,
}

impl AggregatorFactory {
    pub fn new(store: Arc<MetricDataStore>, config: MetricsConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            sets: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<MetricDataStore> {
        &self.store
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Aggregators for an iteration, created and seeded on first request.
    ///
    /// Concurrent first callers all receive the same set; the initial
    /// snapshots are published once.
    pub fn get_or_create(&self, iteration: &Iteration, round_name: &str) -> MetricsResult<Arc<AggregatorSet>> {
        if let Some(existing) = self.sets.get(&iteration.id) {
            return Ok(Arc::clone(existing.value()));
        }

        // The entry guard holds the shard lock, so only one caller builds
        match self.sets.entry(iteration.id) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let ctx = AggregatorContext {
                    identity: Arc::new(iteration.identity(round_name)),
                    settings: Arc::new(iteration.settings.clone()),
                    store: Arc::clone(&self.store),
                    config: Arc::clone(&self.config),
                };
                let set = Arc::new(AggregatorSet::new(ctx)?);
                info!("Monitoring {}", set.identity.label());
                entry.insert(Arc::clone(&set));
                Ok(set)
            }
        }
    }

    /// Lookup without creating
    pub fn try_get(&self, iteration: IterationId) -> Option<Arc<AggregatorSet>> {
        self.sets.get(&iteration).map(|set| Arc::clone(set.value()))
    }

    pub fn contains(&self, iteration: IterationId) -> bool {
        self.sets.contains_key(&iteration)
    }

    /// Identities of every monitored iteration, ordered by round then iteration name
    pub fn monitored_iterations(&self) -> Vec<Arc<IterationIdentity>> {
        let mut identities: Vec<Arc<IterationIdentity>> = self
            .sets
            .iter()
            .map(|entry| Arc::clone(&entry.value().identity))
            .collect();
        identities.sort_by(|a, b| {
            (&a.round_name, &a.iteration_name, a.id).cmp(&(&b.round_name, &b.iteration_name, b.id))
        });
        identities
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Stop an iteration's aggregators (final publish) and forget them.
    ///
    /// The stored history is kept; drop it with
    /// [`MetricDataStore::remove`].
    pub fn remove(&self, iteration: IterationId) -> Option<Arc<AggregatorSet>> {
        let (_, set) = self.sets.remove(&iteration)?;
        if let Err(e) = set.stop_all() {
            warn!("Final publish for {} was incomplete: {}", set.identity.label(), e);
        }
        debug!("Stopped monitoring {}", set.identity.label());
        Some(set)
    }

    /// Stop and forget every iteration. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let ids: Vec<IterationId> = self.sets.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.remove(*id).is_some())
            .count()
    }
}

//! # Metric Data Store
//!
//! The single point through which every aggregator publishes and every
//! reader consumes snapshots. It decouples producer cadence from consumer
//! cadence.
//!
//! ## Layout
//!
//! One [`SnapshotSeries`] per (iteration, metric kind), held in a `DashMap`
//! so unrelated series never contend on a shared lock. Each series keeps:
//!
//! - **latest**: an `ArcSwapOption`, replaced atomically on every push and
//!   read without taking any lock
//! - **history**: a fixed ring of `ArcSwapOption` slots indexed by a push
//!   sequence number. Writers claim a sequence with one atomic add and swap
//!   their slot; readers copy slot by slot. Neither side takes a lock, so a
//!   reader copying a long history never holds up a publishing aggregator.
//!
//! ## Eviction
//!
//! A ring holds at most the configured capacity. Pushing into a full ring
//! overwrites the oldest slot, so the oldest entries are evicted first. The
//! length and eviction count are derived from the push counter. The cap
//! exists to bound memory; it is not a correctness limit.
//!
//! ## Ordering
//!
//! Aggregators push while holding their own lock, so the pushes for one
//! series arrive in a total order and the latest pointer never goes
//! backwards.

use crate::{
    iteration::IterationId,
    snapshot::{MetricKind, MetricSnapshot},
};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type SeriesKey = (IterationId, MetricKind);

/// One ring slot: the snapshot and the push it came from.
#[derive(Debug)]
struct SeriesEntry {
    seq: u64,
    snapshot: Arc<MetricSnapshot>,
}

/// History and latest pointer for one (iteration, kind).
#[derive(Debug)]
struct SnapshotSeries {
    latest: ArcSwapOption<MetricSnapshot>,
    slots: Box<[ArcSwapOption<SeriesEntry>]>,
    /// Pushes claimed so far; also the next sequence number
    pushed: AtomicU64,
}

impl SnapshotSeries {
    fn new(capacity: usize) -> Self {
        Self {
            latest: ArcSwapOption::empty(),
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
            pushed: AtomicU64::new(0),
        }
    }

    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn slot(&self, seq: u64) -> &ArcSwapOption<SeriesEntry> {
        &self.slots[(seq % self.capacity()) as usize]
    }

    fn push(&self, snapshot: Arc<MetricSnapshot>) {
        let seq = self.pushed.fetch_add(1, Ordering::AcqRel);
        let entry = Arc::new(SeriesEntry {
            seq,
            snapshot: Arc::clone(&snapshot),
        });
        // A slower writer never overwrites a newer entry that already wrapped around
        self.slot(seq).rcu(|current| match current {
            Some(existing) if existing.seq > seq => Some(Arc::clone(existing)),
            _ => Some(Arc::clone(&entry)),
        });
        self.latest.store(Some(snapshot));
    }

    /// Oldest first. Slots still being written or already overwritten are skipped.
    fn history(&self) -> Vec<Arc<MetricSnapshot>> {
        let end = self.pushed.load(Ordering::Acquire);
        let start = end.saturating_sub(self.capacity());
        (start..end)
            .filter_map(|seq| {
                let guard = self.slot(seq).load();
                match &*guard {
                    Some(entry) if entry.seq == seq => Some(Arc::clone(&entry.snapshot)),
                    _ => None,
                }
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.pushed.load(Ordering::Acquire).min(self.capacity()) as usize
    }

    fn evicted(&self) -> usize {
        self.pushed
            .load(Ordering::Acquire)
            .saturating_sub(self.capacity()) as usize
    }
}

/// Concurrent store of published snapshots.
#[derive(Debug)]
pub struct MetricDataStore {
    capacity: usize,
    series: DashMap<SeriesKey, Arc<SnapshotSeries>>,
}

impl MetricDataStore {
    /// Create a store whose per-series history holds at most `capacity` snapshots
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn series_for(&self, key: SeriesKey) -> Arc<SnapshotSeries> {
        if let Some(existing) = self.series.get(&key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.series
                .entry(key)
                .or_insert_with(|| Arc::new(SnapshotSeries::new(self.capacity)))
                .value(),
        )
    }

    /// Publish a snapshot: append to its history and make it the latest.
    pub fn push(&self, snapshot: MetricSnapshot) -> Arc<MetricSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.push_shared(Arc::clone(&snapshot));
        snapshot
    }

    /// Publish an already shared snapshot
    pub fn push_shared(&self, snapshot: Arc<MetricSnapshot>) {
        let key = (snapshot.iteration_id(), snapshot.kind());
        // The map guard is released before the ring is touched
        let series = self.series_for(key);
        series.push(snapshot);
    }

    /// Most recent snapshot, or `None` if nothing has been published yet.
    pub fn latest(&self, iteration: IterationId, kind: MetricKind) -> Option<Arc<MetricSnapshot>> {
        let series = self.series.get(&(iteration, kind)).map(|s| Arc::clone(s.value()))?;
        let latest = series.latest.load_full();
        latest
    }

    /// Point-in-time copy of the history, oldest first.
    pub fn history(&self, iteration: IterationId, kind: MetricKind) -> Vec<Arc<MetricSnapshot>> {
        match self.series.get(&(iteration, kind)).map(|s| Arc::clone(s.value())) {
            Some(series) => series.history(),
            None => Vec::new(),
        }
    }

    /// Latest snapshot of every kind that has published for the iteration
    pub fn all_latest(&self, iteration: IterationId) -> Vec<Arc<MetricSnapshot>> {
        MetricKind::ALL
            .into_iter()
            .filter_map(|kind| self.latest(iteration, kind))
            .collect()
    }

    /// Number of snapshots currently held for a series
    pub fn history_len(&self, iteration: IterationId, kind: MetricKind) -> usize {
        self.series
            .get(&(iteration, kind))
            .map_or(0, |s| s.len())
    }

    /// Number of snapshots evicted from a series so far
    pub fn evicted(&self, iteration: IterationId, kind: MetricKind) -> usize {
        self.series
            .get(&(iteration, kind))
            .map_or(0, |s| s.evicted())
    }

    pub fn contains(&self, iteration: IterationId) -> bool {
        MetricKind::ALL
            .into_iter()
            .any(|kind| self.series.contains_key(&(iteration, kind)))
    }

    /// Iterations that have at least one published series
    pub fn iterations(&self) -> Vec<IterationId> {
        let mut ids: Vec<IterationId> = self.series.iter().map(|entry| entry.key().0).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Drop every series of an iteration. Returns `true` if anything was removed.
    pub fn remove(&self, iteration: IterationId) -> bool {
        let mut removed = false;
        for kind in MetricKind::ALL {
            removed |= self.series.remove(&(iteration, kind)).is_some();
        }
        if removed {
            debug!("Removed stored metrics for iteration {}", iteration);
        }
        removed
    }

    pub fn clear(&self) {
        self.series.clear();
    }
}

impl Default for MetricDataStore {
    fn default() -> Self {
        Self::new(crate::defaults::HISTORY_CAPACITY)
    }
}

//! # Metric Aggregators
//!
//! One aggregator per (iteration, metric kind). Each owns its running
//! statistics behind a single `parking_lot::Mutex` and publishes a fresh
//! immutable snapshot to the [`MetricDataStore`] after every mutation.
//!
//! ## Locking
//!
//! The read-modify-publish sequence runs entirely under the aggregator's
//! lock, so publishes from one aggregator are totally ordered. The lock is
//! taken with a bounded wait; an update that cannot get it in time is
//! dropped and reported, never blocked on indefinitely.
//!
//! Aggregators never take each other's locks. When one needs another's
//! figures (throughput needs response codes, data transmission needs the
//! completed request count) it reads the other's latest snapshot from the
//! store, accepting one publish cycle of staleness.
//!
//! ## Timers
//!
//! Throughput and data transmission also recompute on a fixed cadence so
//! their rates keep moving while no requests complete. The [`Ticker`] runs
//! that cadence as a tokio task and is stopped before the final publish.

use crate::{
    config::MetricsConfig,
    error::{MetricsError, MetricsResult},
    events::MetricEvent,
    iteration::{IterationId, IterationIdentity, IterationSettings},
    snapshot::{MetricKind, MetricSnapshot},
    store::MetricDataStore,
};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

pub mod data_transmission;
pub mod duration;
pub mod response_code;
pub mod throughput;

pub use data_transmission::DataTransmissionAggregator;
pub use duration::DurationAggregator;
pub use response_code::ResponseCodeAggregator;
pub use throughput::ThroughputAggregator;

/// Common surface of the four aggregators.
pub trait MetricAggregator: Send + Sync + Debug {
    fn kind(&self) -> MetricKind;

    fn identity(&self) -> &Arc<IterationIdentity>;

    /// Apply one event and publish the result.
    ///
    /// Events meant for another aggregator are rejected with
    /// [`MetricsError::UnsupportedEvent`].
    fn update(&self, event: &MetricEvent) -> MetricsResult<()>;

    /// Begin (or resume) measuring. Never resets counters.
    fn start(&self) -> MetricsResult<()>;

    /// Pause measuring and publish one final snapshot.
    fn stop(&self) -> MetricsResult<()>;

    fn is_running(&self) -> bool;

    /// Current view of the statistics, without publishing it
    fn snapshot(&self) -> MetricsResult<Arc<MetricSnapshot>>;

    /// Build a snapshot and push it to the store
    fn publish(&self) -> MetricsResult<Arc<MetricSnapshot>>;
}

/// Everything an aggregator needs from its surroundings.
#[derive(Debug, Clone)]
pub struct AggregatorContext {
    pub identity: Arc<IterationIdentity>,
    pub settings: Arc<IterationSettings>,
    pub store: Arc<MetricDataStore>,
    pub config: Arc<MetricsConfig>,
}

impl AggregatorContext {
    pub fn iteration_id(&self) -> IterationId {
        self.identity.id
    }

    fn unsupported(&self, aggregator: MetricKind, event: &MetricEvent) -> MetricsError {
        MetricsError::UnsupportedEvent {
            aggregator,
            event: event.kind(),
        }
    }
}

/// Mutex-guarded aggregator state with a bounded acquisition wait.
///
/// Consecutive timeouts are counted; they are logged as warnings until the
/// configured threshold is reached and as errors from then on.
pub(crate) struct GuardedState<T> {
    kind: MetricKind,
    iteration: IterationId,
    state: Mutex<T>,
    lock_wait: Duration,
    escalate_after: u32,
    consecutive_timeouts: AtomicU32,
}

impl<T> GuardedState<T> {
    pub(crate) fn new(kind: MetricKind, ctx: &AggregatorContext, state: T) -> Self {
        Self {
            kind,
            iteration: ctx.iteration_id(),
            state: Mutex::new(state),
            lock_wait: ctx.config.lock_wait,
            escalate_after: ctx.config.lock_escalation_threshold,
            consecutive_timeouts: AtomicU32::new(0),
        }
    }

    /// Run `f` with exclusive access to the state.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> MetricsResult<R> {
        match self.state.try_lock_for(self.lock_wait) {
            Some(mut guard) => {
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                Ok(f(&mut guard))
            }
            None => {
                let consecutive = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                if consecutive >= self.escalate_after {
                    error!(
                        "{} aggregator for iteration {} failed to acquire its lock {} times in a row",
                        self.kind, self.iteration, consecutive
                    );
                } else {
                    warn!(
                        "{} aggregator for iteration {} timed out waiting {:?} for its lock",
                        self.kind, self.iteration, self.lock_wait
                    );
                }
                Err(MetricsError::LockTimeout {
                    kind: self.kind,
                    iteration: self.iteration,
                    consecutive,
                })
            }
        }
    }

    /// Like [`with`](Self::with) for closures that can fail themselves
    pub(crate) fn try_with<R>(&self, f: impl FnOnce(&mut T) -> MetricsResult<R>) -> MetricsResult<R> {
        self.with(f)?
    }

    pub(crate) fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Mutex<T> {
        &self.state
    }
}

impl<T> Debug for GuardedState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedState")
            .field("kind", &self.kind)
            .field("iteration", &self.iteration)
            .field("lock_wait", &self.lock_wait)
            .field("consecutive_timeouts", &self.consecutive_timeouts())
            .finish()
    }
}

/// Work done on every tick of a [`Ticker`].
pub(crate) trait Tick: Send + Sync + 'static {
    fn tick(&self);
}

/// Periodic recompute task for one aggregator.
#[derive(Debug)]
pub(crate) struct Ticker {
    label: String,
    period: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub(crate) fn new(label: String, period: Duration) -> Self {
        Self {
            label,
            period,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the periodic task unless one is already running.
    ///
    /// Outside a tokio runtime the timer is skipped and the owner's `tick`
    /// stays available for manual recomputes.
    pub(crate) fn start<T: Tick>(&self, target: Arc<T>) {
        let mut handle = self.handle.lock();
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    "No tokio runtime available; periodic recompute for {} is disabled",
                    self.label
                );
                return;
            }
        };

        let period = self.period;
        let label = self.label.clone();
        *handle = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                target.tick();
            }
        }));
        debug!("Started {:?} recompute timer for {}", period, label);
    }

    /// Cancel the periodic task. Returns `true` if one was running.
    pub(crate) fn stop(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                debug!("Stopped recompute timer for {}", self.label);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// The fixed four aggregators of one iteration.
#[derive(Debug)]
pub struct AggregatorSet {
    pub identity: Arc<IterationIdentity>,
    pub duration: Arc<DurationAggregator>,
    pub throughput: Arc<ThroughputAggregator>,
    pub response_codes: Arc<ResponseCodeAggregator>,
    pub data_transmission: Arc<DataTransmissionAggregator>,
}

impl AggregatorSet {
    /// Build the four aggregators and seed one initial snapshot per kind.
    pub fn new(ctx: AggregatorContext) -> MetricsResult<Self> {
        let set = Self {
            identity: Arc::clone(&ctx.identity),
            duration: Arc::new(DurationAggregator::new(ctx.clone())?),
            throughput: Arc::new(ThroughputAggregator::new(ctx.clone())),
            response_codes: Arc::new(ResponseCodeAggregator::new(ctx.clone())),
            data_transmission: Arc::new(DataTransmissionAggregator::new(ctx)),
        };

        for aggregator in set.all() {
            aggregator.publish()?;
        }

        Ok(set)
    }

    pub fn iteration_id(&self) -> IterationId {
        self.identity.id
    }

    /// All four aggregators in [`MetricKind::ALL`] order
    pub fn all(&self) -> [&dyn MetricAggregator; 4] {
        [
            self.duration.as_ref(),
            self.throughput.as_ref(),
            self.response_codes.as_ref(),
            self.data_transmission.as_ref(),
        ]
    }

    pub fn get(&self, kind: MetricKind) -> &dyn MetricAggregator {
        match kind {
            MetricKind::Duration => self.duration.as_ref(),
            MetricKind::Throughput => self.throughput.as_ref(),
            MetricKind::ResponseCode => self.response_codes.as_ref(),
            MetricKind::DataTransmission => self.data_transmission.as_ref(),
        }
    }

    /// Route an event to the aggregator that handles it
    pub fn update(&self, event: &MetricEvent) -> MetricsResult<()> {
        self.get(event.kind()).update(event)
    }

    /// Start every aggregator. Stops at the first failure.
    pub fn start_all(&self) -> MetricsResult<()> {
        for aggregator in self.all() {
            aggregator.start()?;
        }
        debug!("Started monitoring {}", self.identity.label());
        Ok(())
    }

    /// Stop every aggregator.
    ///
    /// Response codes are stopped before throughput and throughput before
    /// data transmission, so each final publish reads the others' final
    /// figures. Every aggregator is attempted; the first error is returned.
    pub fn stop_all(&self) -> MetricsResult<()> {
        let order: [&dyn MetricAggregator; 4] = [
            self.duration.as_ref(),
            self.response_codes.as_ref(),
            self.throughput.as_ref(),
            self.data_transmission.as_ref(),
        ];

        let mut first_error = None;
        for aggregator in order {
            if let Err(e) = aggregator.stop() {
                warn!(
                    "Failed to stop {} aggregator for {}: {}",
                    aggregator.kind(),
                    self.identity.label(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Stopped monitoring {}", self.identity.label());
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.all().iter().any(|aggregator| aggregator.is_running())
    }
}

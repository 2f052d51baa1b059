//! # Live Load Metrics Library
//!
//! The live-statistics core of a distributed HTTP load-testing engine. While
//! a test is running, every request reports what happened to it (status
//! code, timing breakdown, bytes transferred) and the core keeps up-to-date
//! aggregate views that dashboards and exporters can read at any moment
//! without slowing down request issuance.
//!
//! ## Metric Kinds
//!
//! Each monitored iteration (one endpoint under one method and HTTP version)
//! gets four aggregators:
//!
//! - **Duration**: count, sum, min, max, average and p50/p90/p95/p99 for
//!   seven timing components
//! - **Throughput**: started, active, successful and failed requests, request
//!   rates per second and per cooldown window, and the error rate
//! - **Response codes**: occurrences per (status code, reason phrase)
//! - **Data transmission**: bytes sent and received, per-request averages and
//!   transfer rates
//!
//! ## Architecture Overview
//!
//! - `aggregator`: per-iteration, per-kind running statistics under a bounded-wait lock
//! - `store`: bounded snapshot history plus a lock-free latest pointer
//! - `factory`: creates each iteration's aggregators exactly once
//! - `events`: the write-path façade the request pipeline calls
//! - `query`: the read-path façade for dashboards and exporters
//! - `export`: pushes new snapshots to pluggable sinks
//! - `report`: the end-of-run JSON report
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use live_load_metrics::{Iteration, MetricKind, MetricsConfig, MetricsRuntime, TimingComponent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = MetricsRuntime::new(MetricsConfig::default())?;
//!     let iteration = Iteration::new("checkout", "POST", "https://shop.test/checkout");
//!     runtime.monitor(&iteration, "round-1")?;
//!
//!     let recorder = runtime.recorder();
//!     recorder.request_started(iteration.id);
//!     recorder.timing(iteration.id, TimingComponent::Total, 120);
//!     recorder.response(iteration.id, 200, "OK");
//!     recorder.request_completed(iteration.id, true);
//!
//!     if let Some(snapshot) = runtime.query().latest(iteration.id, MetricKind::Throughput) {
//!         println!("{}", serde_json::to_string_pretty(&*snapshot)?);
//!     }
//!
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Performance Characteristics
//!
//! - **Bounded memory**: fixed-size HDR histograms and FIFO-capped histories
//! - **No blocking readers**: the latest snapshot is an atomic pointer swap
//! - **Isolated writers**: one lock per aggregator, never held across aggregators
//! - **Infallible write path**: recording logs failures instead of returning them

/// Metric aggregators
///
/// One aggregator per iteration and metric kind, each publishing an immutable
/// snapshot after every mutation. Throughput and data transmission also
/// recompute on a timer so their rates keep moving between requests.
pub mod aggregator;

/// Command-line interface for the demo binary
///
/// Includes duration parsing with human-readable formats (e.g., "10s", "5m")
/// and conversion of the parsed arguments into a [`MetricsConfig`].
pub mod cli;

pub mod config;

pub mod error;

/// Inbound request events and the recorder the request pipeline calls
pub mod events;

/// Snapshot export to external sinks
pub mod export;

pub mod factory;

/// Streaming percentile histogram backed by HDR histograms
pub mod histogram;

pub mod iteration;

pub mod logging;

pub mod query;

/// Rate arithmetic and active-time measurement
pub mod rate;

/// End-of-run report written as JSON
pub mod report;

pub mod runtime;

/// Synthetic load used by the demo binary and end-to-end tests
pub mod simulate;

pub mod snapshot;

/// Bounded, concurrent snapshot store
pub mod store;

pub mod utils;

/// Core lifecycle types
///
/// The runtime bundles the store, factory, query service and recorder for
/// one test run.
pub use runtime::MetricsRuntime;
pub use config::MetricsConfig;
pub use error::{MetricsError, MetricsResult};

/// Iteration identity and settings handed over by the plan model
pub use iteration::{ExecutionMode, Iteration, IterationId, IterationIdentity, IterationSettings};

/// Snapshot model
///
/// Snapshots serialize with a stable `metric_kind` discriminator and flatten
/// to dotted keys for variable substitution.
pub use snapshot::{
    ComponentSummary, DataTransmissionSnapshot, DurationSnapshot, KindedSnapshot, MetricKind,
    MetricSnapshot, ResponseCodeCount, ResponseCodeSnapshot, ThroughputSnapshot, TimingComponent,
};

pub use aggregator::{AggregatorSet, MetricAggregator};
pub use events::{MetricEvent, MetricsRecorder, TransferDirection};
pub use export::{ExportPump, ExportStats, JsonLinesSink, SnapshotExporter, SnapshotSink, TracingSink};
pub use factory::AggregatorFactory;
pub use query::{IterationMetrics, MetricsQueryService};
pub use rate::{RateCalculator, RequestRate};
pub use report::RunReport;
pub use store::MetricDataStore;

/// The current version of the crate
///
/// Populated from Cargo.toml and recorded in every run report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Defaults for [`MetricsConfig`] and for the demo binary's command line.
pub mod defaults {
    use std::time::Duration;

    /// Snapshots kept per (iteration, metric kind)
    ///
    /// Bounds memory for long runs; older snapshots are evicted first.
    pub const HISTORY_CAPACITY: usize = 4096;

    /// Cadence of the throughput and data-transmission recompute
    pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

    /// Largest representable latency sample: 1,000,000 ms (about 16 minutes)
    pub const HISTOGRAM_HIGHEST_MS: u64 = 1_000_000;

    /// Histogram precision
    ///
    /// Three significant figures keeps the relative error of every
    /// percentile reading under 0.1%.
    pub const HISTOGRAM_SIGNIFICANT_FIGURES: u8 = 3;

    /// Window the primary request rate is expressed over
    pub const RATE_WINDOW: Duration = Duration::from_secs(1);

    /// Smallest elapsed time byte rates are divided by
    pub const TRANSFER_ELAPSED_FLOOR: Duration = Duration::from_millis(100);

    /// Longest an update waits for an aggregator lock
    pub const LOCK_WAIT: Duration = Duration::from_millis(100);

    /// Consecutive lock timeouts before warnings escalate to errors
    pub const LOCK_ESCALATION_THRESHOLD: u32 = 10;

    /// How often exporters poll for new snapshots
    pub const EXPORT_INTERVAL: Duration = Duration::from_secs(1);

    /// Synthetic iterations loaded by the demo binary
    pub const ITERATIONS: usize = 2;

    /// Requests per batch in the cooldown modes
    pub const BATCH_SIZE: usize = 25;

    /// Median simulated latency
    pub const MEDIAN_LATENCY_MS: u64 = 120;

    /// Default report file name
    pub const OUTPUT_FILE: &str = "live_metrics_report.json";
}

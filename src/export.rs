//! # Snapshot Export
//!
//! Pushes published snapshots to external consumers. The wire format of a
//! particular time-series backend is not this crate's concern; a backend
//! implements [`SnapshotSink`] and receives each snapshot once.
//!
//! ## Flow
//!
//! A [`SnapshotExporter`] walks the monitored iterations, compares each
//! series' latest snapshot with the last one it pushed and forwards only the
//! newer ones. [`SnapshotExporter::spawn`] runs that on a tokio interval as
//! an [`ExportPump`]; stopping the pump performs one final pass and flushes
//! every sink.
//!
//! ## Failure Isolation
//!
//! Export runs entirely on the read side of the store. A slow or failing
//! sink delays only the pump, never an aggregator update. Sink errors are
//! logged and counted; the snapshot is not retried.

use crate::{
    error::{MetricsError, MetricsResult},
    iteration::{IterationId, IterationIdentity},
    query::MetricsQueryService,
    snapshot::{MetricKind, MetricSnapshot},
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Destination for published snapshots.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Short name used in log lines and errors
    fn name(&self) -> &str;

    async fn push(&self, snapshot: Arc<MetricSnapshot>) -> MetricsResult<()>;

    /// Make everything pushed so far durable
    async fn flush(&self) -> MetricsResult<()> {
        Ok(())
    }
}

/// Writes one flattened JSON object per snapshot per line.
pub struct JsonLinesSink {
    name: String,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Create (or truncate) the output file
    pub async fn create<P: AsRef<Path>>(path: P) -> MetricsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        debug!("Streaming snapshots to {:?}", path);

        Ok(Self {
            name: format!("json-lines:{}", path.display()),
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sink_error(&self, err: std::io::Error) -> MetricsError {
        MetricsError::Sink {
            sink: self.name.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl SnapshotSink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, snapshot: Arc<MetricSnapshot>) -> MetricsResult<()> {
        let flat = snapshot.to_flat_map()?;
        let mut line = serde_json::to_string(&flat)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.sink_error(e))
    }

    async fn flush(&self) -> MetricsResult<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(|e| self.sink_error(e))
    }
}

/// Logs a one-line summary of every snapshot it receives.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl SnapshotSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn push(&self, snapshot: Arc<MetricSnapshot>) -> MetricsResult<()> {
        info!(
            "[{}] {} {}",
            snapshot.kind(),
            snapshot.identity().label(),
            describe(&snapshot)
        );
        Ok(())
    }
}

/// Compact human-readable summary of a snapshot
pub fn describe(snapshot: &MetricSnapshot) -> String {
    match snapshot {
        MetricSnapshot::Duration(s) => {
            let total = s.component(crate::snapshot::TimingComponent::Total);
            format!(
                "samples={} avg={:.1}ms p50={}ms p95={}ms p99={}ms max={}ms",
                total.count, total.average_ms, total.p50_ms, total.p95_ms, total.p99_ms, total.max_ms
            )
        }
        MetricSnapshot::Throughput(s) => format!(
            "started={} active={} ok={} failed={} rate={} errors={:.1}%",
            s.requests_count,
            s.active_requests,
            s.successful_requests,
            s.failed_requests,
            s.requests_rate,
            s.error_rate * 100.0
        ),
        MetricSnapshot::ResponseCode(s) => {
            let buckets: Vec<String> = s
                .responses
                .iter()
                .map(|r| format!("{} {}={}", r.status_code, r.reason, r.count))
                .collect();
            format!("[{}]", buckets.join(", "))
        }
        MetricSnapshot::DataTransmission(s) => format!(
            "sent={}B received={}B up={:.0}B/s down={:.0}B/s",
            s.total_bytes_sent,
            s.total_bytes_received,
            s.upstream_bytes_per_second,
            s.downstream_bytes_per_second
        ),
    }
}

/// Running totals of an exporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportStats {
    pub passes: u64,
    pub pushed: u64,
    pub failures: u64,
}

/// Forwards new snapshots from the store to a set of sinks.
pub struct SnapshotExporter {
    query: MetricsQueryService,
    sinks: Vec<Arc<dyn SnapshotSink>>,
    last_pushed: HashMap<(IterationId, MetricKind), Arc<MetricSnapshot>>,
    known: HashMap<IterationId, Arc<IterationIdentity>>,
    stats: ExportStats,
}

impl SnapshotExporter {
    pub fn new(query: MetricsQueryService) -> Self {
        Self {
            query,
            sinks: Vec::new(),
            last_pushed: HashMap::new(),
            known: HashMap::new(),
            stats: ExportStats::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn stats(&self) -> ExportStats {
        self.stats
    }

    /// Push every snapshot published since the previous pass.
    ///
    /// Iterations seen once keep being polled after they leave monitoring,
    /// so their final snapshots are exported too. They are forgotten once
    /// their stored series are removed. Returns how many snapshots
    /// were forwarded.
    pub async fn export_once(&mut self) -> usize {
        self.stats.passes += 1;
        for identity in self.query.monitored_iterations() {
            self.known.entry(identity.id).or_insert(identity);
        }
        self.prune_dropped();

        let mut fresh = Vec::new();
        for id in self.known.keys() {
            for kind in MetricKind::ALL {
                let Some(latest) = self.query.latest(*id, kind) else {
                    continue;
                };
                let is_new = self
                    .last_pushed
                    .get(&(*id, kind))
                    .map_or(true, |previous| !Arc::ptr_eq(previous, &latest));
                if is_new {
                    fresh.push(((*id, kind), latest));
                }
            }
        }

        for (key, snapshot) in &fresh {
            for sink in &self.sinks {
                match sink.push(Arc::clone(snapshot)).await {
                    Ok(()) => self.stats.pushed += 1,
                    Err(e) => {
                        self.stats.failures += 1;
                        warn!(
                            "Sink {} rejected {} snapshot for {}: {}",
                            sink.name(),
                            key.1,
                            snapshot.identity().label(),
                            e
                        );
                    }
                }
            }
        }

        let count = fresh.len();
        for (key, snapshot) in fresh {
            self.last_pushed.insert(key, snapshot);
        }
        count
    }

    /// Forget iterations whose stored series have all been removed
    fn prune_dropped(&mut self) {
        let query = &self.query;
        let before = self.known.len();
        self.known.retain(|id, _| !query.all_latest(*id).is_empty());
        if self.known.len() == before {
            return;
        }

        let known = &self.known;
        self.last_pushed.retain(|(id, _), _| known.contains_key(id));
        debug!(
            "Stopped exporting {} dropped iterations",
            before - self.known.len()
        );
    }

    pub async fn flush(&mut self) {
        for sink in &self.sinks {
            if let Err(e) = sink.flush().await {
                self.stats.failures += 1;
                warn!("Failed to flush sink {}: {}", sink.name(), e);
            }
        }
    }

    /// Run on a fixed cadence until the returned pump is stopped
    pub fn spawn(mut self, interval: Duration) -> ExportPump {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pushed = self.export_once().await;
                        if pushed > 0 {
                            debug!("Exported {} snapshots", pushed);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            // Final pass picks up the publishes made during shutdown
            self.export_once().await;
            self.flush().await;
            self.stats
        });

        ExportPump { stop_tx, handle }
    }
}

/// Handle to a running export task.
pub struct ExportPump {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<ExportStats>,
}

impl ExportPump {
    /// Stop the task after one final pass and flush
    pub async fn stop(self) -> ExportStats {
        // The task also stops if the sender is dropped
        let _ = self.stop_tx.send(true);
        match self.handle.await {
            Ok(stats) => {
                info!(
                    "Export finished: {} snapshots pushed in {} passes, {} failures",
                    stats.pushed, stats.passes, stats.failures
                );
                stats
            }
            Err(e) => {
                warn!("Export task ended abnormally: {}", e);
                ExportStats::default()
            }
        }
    }
}

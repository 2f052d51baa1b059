use crate::{
    config::MetricsConfig,
    export::ExportStats,
    iteration::IterationIdentity,
    query::{IterationMetrics, MetricsQueryService},
    snapshot::{MetricKind, ThroughputSnapshot},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Host details recorded with every report for reproducibility
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub crate_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            crate_version: crate::VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_iterations: usize,
    pub system_info: SystemInfo,
}

/// Final figures of one iteration
#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub identity: Arc<IterationIdentity>,
    pub metrics: IterationMetrics,
}

/// Totals across every iteration in the report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    /// Iteration with the highest p99 total latency
    pub slowest_iteration: Option<String>,
}

/// End-of-run report: the latest snapshot of every kind per iteration plus
/// run metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub metadata: ReportMetadata,
    pub config: MetricsConfig,
    pub iterations: Vec<IterationReport>,
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportStats>,
}

impl RunReport {
    /// Collect the report from whatever the store currently holds.
    ///
    /// `identities` lists the iterations to include; pass the monitored set
    /// before shutting the runtime down, since shutdown empties it.
    pub fn collect(
        query: &MetricsQueryService,
        identities: &[Arc<IterationIdentity>],
        config: &MetricsConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        let iterations: Vec<IterationReport> = identities
            .iter()
            .map(|identity| IterationReport {
                identity: Arc::clone(identity),
                metrics: query.all_latest(identity.id),
            })
            .collect();

        let summary = summarize(&iterations);
        debug!("Collected report for {} iterations", iterations.len());

        Self {
            metadata: ReportMetadata {
                version: crate::VERSION.to_string(),
                started_at,
                finished_at: Utc::now(),
                total_iterations: iterations.len(),
                system_info: SystemInfo::default(),
            },
            config: config.clone(),
            iterations,
            summary,
            export: None,
        }
    }

    pub fn with_export_stats(mut self, stats: ExportStats) -> Self {
        self.export = Some(stats);
        self
    }

    /// Write the report as pretty-printed JSON
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {:?}", path))?;

        info!("Report written to: {:?}", path);
        Ok(())
    }
}

fn summarize(iterations: &[IterationReport]) -> RunSummary {
    let mut summary = RunSummary::default();
    let mut slowest: Option<(u64, String)> = None;

    for report in iterations {
        let metrics = &report.metrics;

        if let Some(throughput) = metrics
            .get(MetricKind::Throughput)
            .and_then(|s| s.as_throughput().ok())
        {
            add_throughput(&mut summary, throughput);
        }

        if let Some(transfer) = metrics
            .get(MetricKind::DataTransmission)
            .and_then(|s| s.as_data_transmission().ok())
        {
            summary.total_bytes_sent += transfer.total_bytes_sent;
            summary.total_bytes_received += transfer.total_bytes_received;
        }

        if let Some(duration) = metrics
            .get(MetricKind::Duration)
            .and_then(|s| s.as_duration().ok())
        {
            let p99 = duration
                .component(crate::snapshot::TimingComponent::Total)
                .p99_ms;
            if duration.component(crate::snapshot::TimingComponent::Total).count > 0
                && slowest.as_ref().map_or(true, |(worst, _)| p99 > *worst)
            {
                slowest = Some((p99, report.identity.label()));
            }
        }
    }

    summary.error_rate = crate::rate::error_rate(
        summary.failed_requests,
        summary.successful_requests + summary.failed_requests,
    );
    summary.slowest_iteration = slowest.map(|(_, label)| label);
    summary
}

fn add_throughput(summary: &mut RunSummary, throughput: &ThroughputSnapshot) {
    summary.total_requests += throughput.requests_count;
    summary.successful_requests += throughput.successful_requests;
    summary.failed_requests += throughput.failed_requests;
}

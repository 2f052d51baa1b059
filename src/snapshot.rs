//! # Snapshot Model
//!
//! Immutable views of an aggregator's statistics, one shape per metric kind.
//! Every snapshot carries the iteration identity, a publish timestamp and a
//! `metric_kind` discriminator when serialized.
//!
//! ## Stability
//!
//! Field names and the `metric_kind` tag values (`duration`, `throughput`,
//! `response_code`, `data_transmission`) are consumed by dashboards and the
//! variable-substitution system, so they are part of the public contract.
//!
//! ## Sharing
//!
//! Aggregators publish snapshots as `Arc<MetricSnapshot>`. Once a snapshot
//! has been handed to the store nobody holds a mutable path to it, so readers
//! can keep it for as long as they like without seeing it change.

use crate::{
    error::{MetricsError, MetricsResult},
    iteration::{IterationId, IterationIdentity},
    rate::RequestRate,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Discriminator for the four metric kinds tracked per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Duration,
    Throughput,
    ResponseCode,
    DataTransmission,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Duration,
        MetricKind::Throughput,
        MetricKind::ResponseCode,
        MetricKind::DataTransmission,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Duration => "duration",
            MetricKind::Throughput => "throughput",
            MetricKind::ResponseCode => "response_code",
            MetricKind::DataTransmission => "data_transmission",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| MetricsError::UnknownMetricKind(s.to_string()))
    }
}

/// The seven timing components reported for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingComponent {
    Total,
    TcpHandshake,
    TlsHandshake,
    TimeToFirstByte,
    Waiting,
    Sending,
    Receiving,
}

impl TimingComponent {
    pub const ALL: [TimingComponent; 7] = [
        TimingComponent::Total,
        TimingComponent::TcpHandshake,
        TimingComponent::TlsHandshake,
        TimingComponent::TimeToFirstByte,
        TimingComponent::Waiting,
        TimingComponent::Sending,
        TimingComponent::Receiving,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimingComponent::Total => "total",
            TimingComponent::TcpHandshake => "tcp_handshake",
            TimingComponent::TlsHandshake => "tls_handshake",
            TimingComponent::TimeToFirstByte => "time_to_first_byte",
            TimingComponent::Waiting => "waiting",
            TimingComponent::Sending => "sending",
            TimingComponent::Receiving => "receiving",
        }
    }

    /// Position in [`TimingComponent::ALL`]
    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for TimingComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TimingComponent {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let component = match normalized.as_str() {
            "ttfb" => Some(TimingComponent::TimeToFirstByte),
            "tcp" => Some(TimingComponent::TcpHandshake),
            "tls" => Some(TimingComponent::TlsHandshake),
            other => TimingComponent::ALL
                .into_iter()
                .find(|component| component.as_str() == other),
        };
        component.ok_or_else(|| MetricsError::UnknownComponent(s.to_string()))
    }
}

/// Running statistics for one timing component, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub average_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationSnapshot {
    pub identity: Arc<IterationIdentity>,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeMap<TimingComponent, ComponentSummary>,
}

impl DurationSnapshot {
    /// Summary for one component; components with no samples read as zero.
    pub fn component(&self, component: TimingComponent) -> ComponentSummary {
        self.components
            .get(&component)
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSnapshot {
    pub identity: Arc<IterationIdentity>,
    pub timestamp: DateTime<Utc>,
    /// Requests started since monitoring began
    pub requests_count: u64,
    pub active_requests: u64,
    /// Provisional between recomputes, not cumulative.
    ///
    /// Completions count as successful when a response arrives; the next
    /// recompute moves those with a failure status code into
    /// `failed_requests`, so this value can drop from one snapshot to the
    /// next. `completed_requests()` and `failed_requests` never decrease.
    pub successful_requests: u64,
    /// Transport failures plus failure-coded responses as of the last recompute
    pub failed_requests: u64,
    pub elapsed_active_ms: u64,
    pub requests_rate: RequestRate,
    pub cooldown_requests_rate: Option<RequestRate>,
    pub error_rate: f64,
}

impl ThroughputSnapshot {
    pub fn completed_requests(&self) -> u64 {
        self.successful_requests + self.failed_requests
    }
}

/// Occurrences of one (status code, reason phrase) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCodeCount {
    pub status_code: u16,
    pub reason: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCodeSnapshot {
    pub identity: Arc<IterationIdentity>,
    pub timestamp: DateTime<Utc>,
    /// Unordered; a new pair is appended the first time it is seen
    pub responses: Vec<ResponseCodeCount>,
}

impl ResponseCodeSnapshot {
    pub fn total(&self) -> u64 {
        self.responses.iter().map(|r| r.count).sum()
    }

    pub fn count_of(&self, status_code: u16, reason: &str) -> u64 {
        self.responses
            .iter()
            .find(|r| r.status_code == status_code && r.reason == reason)
            .map_or(0, |r| r.count)
    }

    /// Sum of counts whose status code satisfies `predicate`
    pub fn count_where(&self, predicate: impl Fn(u16) -> bool) -> u64 {
        self.responses
            .iter()
            .filter(|r| predicate(r.status_code))
            .map(|r| r.count)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransmissionSnapshot {
    pub identity: Arc<IterationIdentity>,
    pub timestamp: DateTime<Utc>,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub average_bytes_sent: f64,
    pub average_bytes_received: f64,
    pub upstream_bytes_per_second: f64,
    pub downstream_bytes_per_second: f64,
    pub total_bytes_per_second: f64,
    pub elapsed_active_ms: u64,
}

/// A published snapshot of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric_kind", rename_all = "snake_case")]
pub enum MetricSnapshot {
    Duration(DurationSnapshot),
    Throughput(ThroughputSnapshot),
    ResponseCode(ResponseCodeSnapshot),
    DataTransmission(DataTransmissionSnapshot),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Duration(_) => MetricKind::Duration,
            MetricSnapshot::Throughput(_) => MetricKind::Throughput,
            MetricSnapshot::ResponseCode(_) => MetricKind::ResponseCode,
            MetricSnapshot::DataTransmission(_) => MetricKind::DataTransmission,
        }
    }

    pub fn identity(&self) -> &Arc<IterationIdentity> {
        match self {
            MetricSnapshot::Duration(s) => &s.identity,
            MetricSnapshot::Throughput(s) => &s.identity,
            MetricSnapshot::ResponseCode(s) => &s.identity,
            MetricSnapshot::DataTransmission(s) => &s.identity,
        }
    }

    pub fn iteration_id(&self) -> IterationId {
        self.identity().id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MetricSnapshot::Duration(s) => s.timestamp,
            MetricSnapshot::Throughput(s) => s.timestamp,
            MetricSnapshot::ResponseCode(s) => s.timestamp,
            MetricSnapshot::DataTransmission(s) => s.timestamp,
        }
    }

    pub fn as_duration(&self) -> MetricsResult<&DurationSnapshot> {
        DurationSnapshot::from_snapshot(self)
    }

    pub fn as_throughput(&self) -> MetricsResult<&ThroughputSnapshot> {
        ThroughputSnapshot::from_snapshot(self)
    }

    pub fn as_response_code(&self) -> MetricsResult<&ResponseCodeSnapshot> {
        ResponseCodeSnapshot::from_snapshot(self)
    }

    pub fn as_data_transmission(&self) -> MetricsResult<&DataTransmissionSnapshot> {
        DataTransmissionSnapshot::from_snapshot(self)
    }

    /// Flatten into dotted keys, e.g. `components.total.p95_ms`.
    ///
    /// The identity is flattened under `identity.*` and the discriminator is
    /// kept as `metric_kind`.
    pub fn to_flat_map(&self) -> MetricsResult<BTreeMap<String, Value>> {
        let value = serde_json::to_value(self)?;
        let mut flat = BTreeMap::new();
        flatten_into(String::new(), value, &mut flat);
        Ok(flat)
    }

    /// Like [`to_flat_map`](Self::to_flat_map) but degrades to an empty map
    /// when serialization fails.
    pub fn flat_or_empty(&self) -> BTreeMap<String, Value> {
        match self.to_flat_map() {
            Ok(flat) => flat,
            Err(e) => {
                warn!(
                    "Dropping {} snapshot payload for iteration {}: {}",
                    self.kind(),
                    self.iteration_id(),
                    e
                );
                BTreeMap::new()
            }
        }
    }
}

fn flatten_into(prefix: String, value: Value, out: &mut BTreeMap<String, Value>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    };

    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(join(&key), nested, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.into_iter().enumerate() {
                flatten_into(join(&index.to_string()), nested, out);
            }
        }
        leaf => {
            out.insert(prefix, leaf);
        }
    }
}

/// Typed access to one variant of [`MetricSnapshot`].
pub trait KindedSnapshot: Sized {
    const KIND: MetricKind;

    fn from_snapshot(snapshot: &MetricSnapshot) -> MetricsResult<&Self>;
}

macro_rules! kinded_snapshot {
    ($ty:ty, $variant:ident) => {
        impl KindedSnapshot for $ty {
            const KIND: MetricKind = MetricKind::$variant;

            fn from_snapshot(snapshot: &MetricSnapshot) -> MetricsResult<&Self> {
                match snapshot {
                    MetricSnapshot::$variant(inner) => Ok(inner),
                    other => Err(MetricsError::KindMismatch {
                        expected: Self::KIND,
                        actual: other.kind(),
                    }),
                }
            }
        }

        impl From<$ty> for MetricSnapshot {
            fn from(inner: $ty) -> Self {
                MetricSnapshot::$variant(inner)
            }
        }
    };
}

kinded_snapshot!(DurationSnapshot, Duration);
kinded_snapshot!(ThroughputSnapshot, Throughput);
kinded_snapshot!(ResponseCodeSnapshot, ResponseCode);
kinded_snapshot!(DataTransmissionSnapshot, DataTransmission);

//! Error types for the live metrics core.
//!
//! Nothing here is allowed to escape the request-completion path: the
//! [`MetricsRecorder`](crate::events::MetricsRecorder) logs every error it
//! receives and moves on. Readers and configuration code get the typed
//! error so they can decide for themselves.

use crate::{iteration::IterationId, snapshot::MetricKind};
use thiserror::Error;

/// Result alias used across the library.
pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    /// A typed read asked for one kind of snapshot but the stored value is another.
    #[error("expected a {expected} snapshot but found {actual}")]
    KindMismatch {
        expected: MetricKind,
        actual: MetricKind,
    },

    /// An event was routed to an aggregator that does not handle it.
    #[error("{aggregator} aggregator cannot handle a {event} event")]
    UnsupportedEvent {
        aggregator: MetricKind,
        event: MetricKind,
    },

    #[error("unknown timing component '{0}'")]
    UnknownComponent(String),

    #[error("unknown metric kind '{0}'")]
    UnknownMetricKind(String),

    #[error("iteration {0} is not monitored")]
    NotMonitored(IterationId),

    /// The aggregator lock could not be taken within the configured wait.
    #[error("timed out acquiring the {kind} aggregator lock for iteration {iteration} ({consecutive} consecutive failures)")]
    LockTimeout {
        kind: MetricKind,
        iteration: IterationId,
        consecutive: u32,
    },

    #[error("histogram error: {0}")]
    Histogram(String),

    #[error("failed to serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sink '{sink}' failed: {reason}")]
    Sink { sink: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<hdrhistogram::CreationError> for MetricsError {
    fn from(err: hdrhistogram::CreationError) -> Self {
        MetricsError::Histogram(format!("{:?}", err))
    }
}

impl From<hdrhistogram::RecordError> for MetricsError {
    fn from(err: hdrhistogram::RecordError) -> Self {
        MetricsError::Histogram(format!("{:?}", err))
    }
}

//! # Inbound Events
//!
//! The request pipeline reports what happened to each request through
//! [`MetricsRecorder`]. Events for one request may arrive in any order and
//! from any task.
//!
//! The recorder never creates monitoring for an iteration and never returns
//! an error: an event for an unregistered iteration is dropped, and every
//! aggregator failure becomes a log line. Recording a metric must not be able
//! to fail the request that produced it.

use crate::{
    error::MetricsError,
    factory::AggregatorFactory,
    iteration::IterationId,
    snapshot::{MetricKind, TimingComponent},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Direction of a byte transfer, seen from the load generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Sent,
    Received,
}

/// One observation from the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    RequestStarted,
    /// `success` means a response came back at all; status classification
    /// happens later against the iteration's failure codes.
    RequestCompleted { success: bool },
    Response { status_code: u16, reason: String },
    Timing { component: TimingComponent, millis: u64 },
    Transfer { direction: TransferDirection, bytes: u64 },
}

impl MetricEvent {
    /// The metric kind whose aggregator consumes this event
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricEvent::RequestStarted | MetricEvent::RequestCompleted { .. } => {
                MetricKind::Throughput
            }
            MetricEvent::Response { .. } => MetricKind::ResponseCode,
            MetricEvent::Timing { .. } => MetricKind::Duration,
            MetricEvent::Transfer { .. } => MetricKind::DataTransmission,
        }
    }
}

/// Write-path façade handed to the request pipeline.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    factory: Arc<AggregatorFactory>,
}

impl MetricsRecorder {
    pub fn new(factory: Arc<AggregatorFactory>) -> Self {
        Self { factory }
    }

    /// Route an event to the iteration's aggregator.
    ///
    /// Returns `true` if the event was applied.
    pub fn record(&self, iteration: IterationId, event: MetricEvent) -> bool {
        let Some(set) = self.factory.try_get(iteration) else {
            trace!(
                "Dropping {:?} for unmonitored iteration {}",
                event,
                iteration
            );
            return false;
        };

        match set.update(&event) {
            Ok(()) => true,
            Err(e @ MetricsError::LockTimeout { .. }) => {
                // Already reported by the aggregator with escalation
                debug!("Dropped {:?}: {}", event, e);
                false
            }
            Err(e) => {
                warn!(
                    "Failed to record {:?} for iteration {}: {}",
                    event, iteration, e
                );
                false
            }
        }
    }

    pub fn request_started(&self, iteration: IterationId) -> bool {
        self.record(iteration, MetricEvent::RequestStarted)
    }

    pub fn request_completed(&self, iteration: IterationId, success: bool) -> bool {
        self.record(iteration, MetricEvent::RequestCompleted { success })
    }

    pub fn response(&self, iteration: IterationId, status_code: u16, reason: &str) -> bool {
        self.record(
            iteration,
            MetricEvent::Response {
                status_code,
                reason: reason.to_string(),
            },
        )
    }

    pub fn timing(&self, iteration: IterationId, component: TimingComponent, millis: u64) -> bool {
        self.record(iteration, MetricEvent::Timing { component, millis })
    }

    /// Record a timing sample for a component given by name.
    ///
    /// Unknown names are logged and the sample is dropped.
    pub fn timing_named(&self, iteration: IterationId, component: &str, millis: u64) -> bool {
        match component.parse::<TimingComponent>() {
            Ok(component) => self.timing(iteration, component, millis),
            Err(e) => {
                warn!("Dropping timing sample for iteration {}: {}", iteration, e);
                false
            }
        }
    }

    pub fn sent(&self, iteration: IterationId, bytes: u64) -> bool {
        self.record(
            iteration,
            MetricEvent::Transfer {
                direction: TransferDirection::Sent,
                bytes,
            },
        )
    }

    pub fn received(&self, iteration: IterationId, bytes: u64) -> bool {
        self.record(
            iteration,
            MetricEvent::Transfer {
                direction: TransferDirection::Received,
                bytes,
            },
        )
    }
}

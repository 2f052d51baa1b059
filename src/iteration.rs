//! Iteration identity and the per-iteration settings the metrics core consumes.
//!
//! The plan/round/iteration model itself lives outside this crate. What it
//! hands over is captured by [`Iteration`]: a stable identifier, display
//! metadata, and the two settings that change how rates and error rates are
//! computed (failure status codes and execution mode).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Opaque, stable identifier for one iteration under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IterationId(Uuid);

impl IterationId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for IterationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IterationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for IterationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identity plus display metadata shared by every snapshot of an iteration.
///
/// Built once when monitoring is registered and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterationIdentity {
    pub id: IterationId,
    pub round_name: String,
    pub iteration_name: String,
    pub http_method: String,
    pub url: String,
    pub http_version: String,
}

impl IterationIdentity {
    /// Short label used in log lines and dashboards
    pub fn label(&self) -> String {
        format!(
            "{}/{} {} {}",
            self.round_name, self.iteration_name, self.http_method, self.url
        )
    }
}

/// How an iteration issues its requests.
///
/// Only the cooldown/batch strategies report a per-cooldown-window rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Issue a fixed number of requests back to back
    RequestCount,
    /// Issue requests continuously for a fixed duration
    Duration,
    /// Issue batches of requests separated by a cooldown pause
    CooldownBatch,
    /// Issue cooldown-separated batches for a fixed duration
    DurationCooldownBatch,
}

impl ExecutionMode {
    pub fn uses_cooldown(&self) -> bool {
        matches!(
            self,
            ExecutionMode::CooldownBatch | ExecutionMode::DurationCooldownBatch
        )
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::RequestCount => write!(f, "Request Count"),
            ExecutionMode::Duration => write!(f, "Duration"),
            ExecutionMode::CooldownBatch => write!(f, "Cooldown Batch"),
            ExecutionMode::DurationCooldownBatch => write!(f, "Duration Cooldown Batch"),
        }
    }
}

/// Settings supplied by the iteration/plan model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationSettings {
    pub mode: ExecutionMode,

    /// Pause between batches; only meaningful when `mode.uses_cooldown()`
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,

    /// Status codes that count as failed for error-rate purposes
    pub failure_status_codes: BTreeSet<u16>,
}

impl IterationSettings {
    pub fn is_failure(&self, status_code: u16) -> bool {
        self.failure_status_codes.contains(&status_code)
    }

    /// Cooldown window to report rates over, if this mode reports one at all
    pub fn cooldown_window(&self) -> Option<Duration> {
        if self.mode.uses_cooldown() && !self.cooldown.is_zero() {
            Some(self.cooldown)
        } else {
            None
        }
    }
}

impl Default for IterationSettings {
    /// Continuous requests, every 5xx counted as a failure.
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Duration,
            cooldown: Duration::ZERO,
            failure_status_codes: (500..=599).collect(),
        }
    }
}

/// An iteration as handed over by the plan model when monitoring starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: IterationId,
    pub name: String,
    pub http_method: String,
    pub url: String,
    pub http_version: String,
    pub settings: IterationSettings,
}

impl Iteration {
    pub fn new(name: impl Into<String>, http_method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: IterationId::new(),
            name: name.into(),
            http_method: http_method.into(),
            url: url.into(),
            http_version: "HTTP/1.1".to_string(),
            settings: IterationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: IterationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_http_version(mut self, http_version: impl Into<String>) -> Self {
        self.http_version = http_version.into();
        self
    }

    /// Build the immutable identity used to tag every snapshot
    pub fn identity(&self, round_name: &str) -> IterationIdentity {
        IterationIdentity {
            id: self.id,
            round_name: round_name.to_string(),
            iteration_name: self.name.clone(),
            http_method: self.http_method.clone(),
            url: self.url.clone(),
            http_version: self.http_version.clone(),
        }
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

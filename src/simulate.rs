//! # Synthetic Load
//!
//! Stands in for the HTTP pipeline so the metrics core can be driven end to
//! end without a network. Workers issue fake requests against a set of
//! iterations and report each one through the [`MetricsRecorder`] exactly as
//! the real pipeline would: started, timing breakdown, bytes, status code,
//! completion.
//!
//! Latencies, status codes and payload sizes are random. Nothing actually
//! waits for the simulated latency; workers pace themselves with the request
//! interval (and the cooldown pause in batch modes) so a run stays short.

use crate::{
    cli::Args,
    events::MetricsRecorder,
    iteration::{ExecutionMode, Iteration, IterationSettings},
    snapshot::TimingComponent,
};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Shape of the synthetic load
#[derive(Debug, Clone)]
pub struct LoadProfile {
    pub iterations: usize,
    pub workers: usize,
    pub duration: Duration,
    pub mode: ExecutionMode,
    pub cooldown: Duration,
    pub batch_size: usize,
    pub request_interval: Duration,
    pub median_latency_ms: u64,
    pub error_ratio: f64,
    pub transport_failure_ratio: f64,
}

impl Default for LoadProfile {
    fn default() -> Self {
        Self {
            iterations: crate::defaults::ITERATIONS,
            workers: num_cpus::get(),
            duration: Duration::from_secs(10),
            mode: ExecutionMode::Duration,
            cooldown: Duration::from_secs(2),
            batch_size: crate::defaults::BATCH_SIZE,
            request_interval: Duration::from_millis(20),
            median_latency_ms: crate::defaults::MEDIAN_LATENCY_MS,
            error_ratio: 0.05,
            transport_failure_ratio: 0.01,
        }
    }
}

impl From<&Args> for LoadProfile {
    fn from(args: &Args) -> Self {
        Self {
            iterations: args.iterations.max(1),
            workers: args.worker_count(),
            duration: args.duration,
            mode: args.mode.into(),
            cooldown: args.cooldown,
            batch_size: args.batch_size.max(1),
            request_interval: args.request_interval,
            median_latency_ms: args.median_latency_ms.max(1),
            error_ratio: args.error_ratio.clamp(0.0, 1.0),
            transport_failure_ratio: args.transport_failure_ratio.clamp(0.0, 1.0),
        }
    }
}

impl LoadProfile {
    /// The synthetic endpoints this profile loads
    pub fn build_iterations(&self) -> Vec<Iteration> {
        const ENDPOINTS: [(&str, &str, &str); 4] = [
            ("browse", "GET", "/products"),
            ("search", "GET", "/search?q=rust"),
            ("add-to-cart", "POST", "/cart/items"),
            ("checkout", "POST", "/checkout"),
        ];

        (0..self.iterations)
            .map(|i| {
                let (name, method, path) = ENDPOINTS[i % ENDPOINTS.len()];
                let name = if i < ENDPOINTS.len() {
                    name.to_string()
                } else {
                    format!("{}-{}", name, i / ENDPOINTS.len() + 1)
                };
                let settings = IterationSettings {
                    mode: self.mode,
                    cooldown: self.cooldown,
                    ..Default::default()
                };
                Iteration::new(name, method, format!("https://shop.test{}", path))
                    .with_settings(settings)
            })
            .collect()
    }
}

/// What one simulated request looked like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticRequest {
    /// `None` when the request failed before any response arrived
    pub status: Option<(u16, &'static str)>,
    pub timings: Vec<(TimingComponent, u64)>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl SyntheticRequest {
    pub fn generate<R: Rng>(rng: &mut R, profile: &LoadProfile) -> Self {
        // Spread latencies between half and about three times the median
        let factor = 2f64.powf(rng.gen_range(-1.0..1.6));
        let total = ((profile.median_latency_ms as f64) * factor).round().max(1.0) as u64;

        let tcp = total / 10;
        let tls = total * 15 / 100;
        let sending = total / 50;
        let waiting = total / 2;
        let ttfb = tcp + tls + sending + waiting;
        let receiving = total.saturating_sub(ttfb);

        let bytes_sent = rng.gen_range(200..2_000);
        if rng.gen_bool(profile.transport_failure_ratio) {
            return Self {
                status: None,
                timings: vec![
                    (TimingComponent::Total, tcp),
                    (TimingComponent::TcpHandshake, tcp),
                ],
                bytes_sent,
                bytes_received: 0,
            };
        }

        let status = if rng.gen_bool(profile.error_ratio) {
            if rng.gen_bool(0.5) {
                (500, "Internal Server Error")
            } else {
                (503, "Service Unavailable")
            }
        } else if rng.gen_bool(0.03) {
            (404, "Not Found")
        } else {
            (200, "OK")
        };

        Self {
            status: Some(status),
            timings: vec![
                (TimingComponent::Total, total),
                (TimingComponent::TcpHandshake, tcp),
                (TimingComponent::TlsHandshake, tls),
                (TimingComponent::Sending, sending),
                (TimingComponent::Waiting, waiting),
                (TimingComponent::TimeToFirstByte, ttfb),
                (TimingComponent::Receiving, receiving),
            ],
            bytes_sent,
            bytes_received: rng.gen_range(512..64_000),
        }
    }

    /// Report this request for one iteration
    pub fn report(&self, recorder: &MetricsRecorder, iteration: crate::iteration::IterationId) {
        recorder.request_started(iteration);
        recorder.sent(iteration, self.bytes_sent);
        for (component, millis) in &self.timings {
            recorder.timing(iteration, *component, *millis);
        }
        if let Some((code, reason)) = self.status {
            recorder.response(iteration, code, reason);
            recorder.received(iteration, self.bytes_received);
        }
        recorder.request_completed(iteration, self.status.is_some());
    }
}

/// Totals of a finished load run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub requests: u64,
    pub transport_failures: u64,
}

/// Drives synthetic requests through a recorder
pub struct LoadGenerator {
    profile: LoadProfile,
    recorder: MetricsRecorder,
}

impl LoadGenerator {
    pub fn new(profile: LoadProfile, recorder: MetricsRecorder) -> Self {
        Self { profile, recorder }
    }

    pub fn profile(&self) -> &LoadProfile {
        &self.profile
    }

    /// Run until the profile's duration has elapsed.
    ///
    /// Dropping the returned future before it completes stops every worker.
    pub async fn run(&self, iterations: &[Iteration]) -> Result<LoadSummary> {
        if iterations.is_empty() {
            return Ok(LoadSummary::default());
        }

        let ids: Arc<Vec<_>> = Arc::new(iterations.iter().map(|it| it.id).collect());
        let deadline = Instant::now() + self.profile.duration;
        info!(
            "Starting {} workers against {} iterations for {:?}",
            self.profile.workers,
            ids.len(),
            self.profile.duration
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.profile.workers {
            let ids = Arc::clone(&ids);
            let profile = self.profile.clone();
            let recorder = self.recorder.clone();
            workers.spawn(async move { run_worker(worker_id, &ids, &profile, &recorder, deadline).await });
        }

        let mut summary = LoadSummary::default();
        while let Some(result) = workers.join_next().await {
            let worker = result.context("Load worker panicked")?;
            summary.requests += worker.requests;
            summary.transport_failures += worker.transport_failures;
        }

        info!(
            "Load finished: {} requests, {} transport failures",
            summary.requests, summary.transport_failures
        );
        Ok(summary)
    }
}

async fn run_worker(
    worker_id: usize,
    ids: &[crate::iteration::IterationId],
    profile: &LoadProfile,
    recorder: &MetricsRecorder,
    deadline: Instant,
) -> LoadSummary {
    let mut rng = StdRng::from_entropy();
    let mut summary = LoadSummary::default();
    let mut in_batch = 0usize;

    while Instant::now() < deadline {
        let iteration = ids[(worker_id + summary.requests as usize) % ids.len()];
        let request = SyntheticRequest::generate(&mut rng, profile);
        request.report(recorder, iteration);

        summary.requests += 1;
        if request.status.is_none() {
            summary.transport_failures += 1;
        }

        in_batch += 1;
        if profile.mode.uses_cooldown() && in_batch >= profile.batch_size {
            in_batch = 0;
            sleep(profile.cooldown).await;
        } else {
            sleep(profile.request_interval).await;
        }
    }

    debug!("Worker {} issued {} requests", worker_id, summary.requests);
    summary
}

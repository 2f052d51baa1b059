use crate::{config::MetricsConfig, iteration::ExecutionMode};
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Live Load Metrics - drive synthetic load through the live statistics core
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Number of synthetic iterations (endpoints) to load in parallel
    #[clap(short = 'i', long, default_value_t = crate::defaults::ITERATIONS, help_heading = "Load Options")]
    pub iterations: usize,

    /// Worker tasks issuing requests (defaults to the number of CPUs)
    #[clap(short = 'w', long, help_heading = "Load Options")]
    pub workers: Option<usize>,

    /// How long to run the load (e.g. "10s", "2m")
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "10s", help_heading = "Load Options")]
    pub duration: Duration,

    /// Execution mode reported to the metrics core
    #[clap(short = 'm', long, value_enum, default_value_t = LoadMode::Duration, help_heading = "Load Options")]
    pub mode: LoadMode,

    /// Pause between batches in the cooldown modes
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Load Options")]
    pub cooldown: Duration,

    /// Requests per batch in the cooldown modes
    #[clap(long, default_value_t = crate::defaults::BATCH_SIZE, help_heading = "Load Options")]
    pub batch_size: usize,

    /// Pause between requests issued by one worker
    #[clap(long, value_parser = parse_duration, default_value = "20ms", help_heading = "Load Options")]
    pub request_interval: Duration,

    /// Median simulated total latency in milliseconds
    #[clap(long, default_value_t = crate::defaults::MEDIAN_LATENCY_MS, help_heading = "Load Options")]
    pub median_latency_ms: u64,

    /// Fraction of responses that carry a server error status
    #[clap(long, default_value_t = 0.05, help_heading = "Load Options")]
    pub error_ratio: f64,

    /// Fraction of requests that fail without any response
    #[clap(long, default_value_t = 0.01, help_heading = "Load Options")]
    pub transport_failure_ratio: f64,

    /// Snapshots kept per iteration and metric kind
    #[clap(long, default_value_t = crate::defaults::HISTORY_CAPACITY, help_heading = "Metrics Options")]
    pub history_capacity: usize,

    /// Cadence of the rate recompute timers
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Metrics Options")]
    pub tick_interval: Duration,

    /// Largest latency the histograms represent, in milliseconds
    #[clap(long, default_value_t = crate::defaults::HISTOGRAM_HIGHEST_MS, help_heading = "Metrics Options")]
    pub histogram_max_ms: u64,

    /// Histogram precision in significant figures (1-5)
    #[clap(long, default_value_t = crate::defaults::HISTOGRAM_SIGNIFICANT_FIGURES, help_heading = "Metrics Options")]
    pub histogram_precision: u8,

    /// Longest an update waits for an aggregator lock
    #[clap(long, value_parser = parse_duration, default_value = "100ms", help_heading = "Metrics Options")]
    pub lock_wait: Duration,

    /// How often the live table is redrawn and snapshots are exported
    #[clap(short = 'r', long, value_parser = parse_duration, default_value = "1s", help_heading = "Output Options")]
    pub refresh: Duration,

    /// Do not print the live table
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output Options")]
    pub quiet: bool,

    /// Output file for the final report (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE, help_heading = "Output Options")]
    pub output_file: PathBuf,

    /// JSON-lines file receiving every published snapshot during the run
    #[clap(long, help_heading = "Output Options")]
    pub streaming_output: Option<PathBuf>,

    /// Also write log output to this file
    #[clap(long, help_heading = "Output Options")]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Execution modes selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum LoadMode {
    /// Continuous requests for the whole duration
    #[clap(name = "duration")]
    Duration,

    /// Batches separated by the cooldown pause
    #[clap(name = "cooldown")]
    CooldownBatch,

    /// Cooldown batches for the whole duration
    #[clap(name = "duration-cooldown")]
    DurationCooldownBatch,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ExecutionMode::from(*self).fmt(f)
    }
}

impl From<LoadMode> for ExecutionMode {
    fn from(mode: LoadMode) -> Self {
        match mode {
            LoadMode::Duration => ExecutionMode::Duration,
            LoadMode::CooldownBatch => ExecutionMode::CooldownBatch,
            LoadMode::DurationCooldownBatch => ExecutionMode::DurationCooldownBatch,
        }
    }
}

impl Args {
    /// Worker count, falling back to the number of CPUs
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

impl From<&Args> for MetricsConfig {
    fn from(args: &Args) -> Self {
        Self {
            history_capacity: args.history_capacity,
            tick_interval: args.tick_interval,
            histogram_highest_ms: args.histogram_max_ms,
            histogram_significant_figures: args.histogram_precision,
            lock_wait: args.lock_wait,
            export_interval: args.refresh,
            ..MetricsConfig::default()
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a finite, non-negative number: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

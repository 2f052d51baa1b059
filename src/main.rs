//! # Live Load Metrics - Main Entry Point
//!
//! Drives synthetic load through the live statistics core and shows the
//! aggregates while the load is running.
//!
//! ## Flow
//!
//! 1. **Initialize logging**: colorized console output, optional log file
//! 2. **Parse arguments**: load shape and metrics tunables
//! 3. **Start monitoring**: one aggregator set per synthetic iteration
//! 4. **Run load**: worker tasks report every request through the recorder
//! 5. **Observe**: a live table and optional snapshot export on a fixed cadence
//! 6. **Shut down**: final publish, final export, JSON report
//!
//! ## Error Handling
//!
//! Setup and report failures end the run with an `anyhow` error. Nothing the
//! metrics core does while load is running can fail a request.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::*;
use live_load_metrics::{
    cli::Args,
    export::{JsonLinesSink, SnapshotExporter, SnapshotSink, TracingSink},
    logging::init_logging,
    query::MetricsQueryService,
    report::RunReport,
    simulate::{LoadGenerator, LoadProfile},
    utils::{
        create_progress_indicator, fit_cell, format_millis, format_percent, format_rate,
        format_request_rate, print_cells, print_table_row, print_table_separator,
    },
    IterationIdentity, MetricsConfig, MetricsRuntime, TimingComponent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

const TABLE_WIDTHS: [usize; 10] = [28, 9, 7, 7, 14, 7, 10, 10, 10, 12];
const ERRORS_COLUMN: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    info!("Starting Live Load Metrics v{}", live_load_metrics::VERSION);
    info!("Configuration: {:?}", args);

    let config = MetricsConfig::from(&args);
    let runtime = MetricsRuntime::new(config.clone()).context("Invalid metrics configuration")?;

    let profile = LoadProfile::from(&args);
    let iterations = profile.build_iterations();
    for iteration in &iterations {
        runtime
            .monitor(iteration, "round-1")
            .with_context(|| format!("Failed to start monitoring {}", iteration.name))?;
    }
    let identities = runtime.query().monitored_iterations();

    // Export pump: always log at debug, optionally stream to a file
    let mut exporter = SnapshotExporter::new(runtime.query().clone());
    if args.verbose > 0 {
        exporter = exporter.with_sink(Arc::new(TracingSink));
    }
    if let Some(ref path) = args.streaming_output {
        info!("Streaming snapshots to: {:?}", path);
        let sink = JsonLinesSink::create(path)
            .await
            .with_context(|| format!("Failed to open streaming output {:?}", path))?;
        exporter = exporter.with_sink(Arc::new(sink) as Arc<dyn SnapshotSink>);
    }
    let pump = exporter.spawn(config.export_interval);

    // Live table
    let (stop_tx, stop_rx) = watch::channel(false);
    let display = (!args.quiet).then(|| {
        tokio::spawn(run_display(
            runtime.query().clone(),
            identities.clone(),
            args.refresh,
            args.duration,
            stop_rx,
        ))
    });

    let started_at = Utc::now();
    let generator = LoadGenerator::new(profile, runtime.recorder().clone());
    let summary = tokio::select! {
        result = generator.run(&iterations) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping load early");
            Default::default()
        }
    };

    let _ = stop_tx.send(true);
    if let Some(display) = display {
        if let Err(e) = display.await {
            warn!("Live display ended abnormally: {}", e);
        }
    }

    runtime.shutdown();
    let export_stats = pump.stop().await;

    println!();
    println!("{}", "Final results".bold());
    print_table(runtime.query(), &identities);

    let report = RunReport::collect(runtime.query(), &identities, &config, started_at)
        .with_export_stats(export_stats);
    report.write_to(&args.output_file)?;

    info!(
        "Live Load Metrics completed: {} requests, error rate {}",
        summary.requests,
        format_percent(report.summary.error_rate)
    );
    Ok(())
}

/// Redraw the live table every `refresh` until told to stop
async fn run_display(
    query: MetricsQueryService,
    identities: Vec<Arc<IterationIdentity>>,
    refresh: Duration,
    total: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(refresh.max(Duration::from_millis(100)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let elapsed = started.elapsed();
                println!(
                    "{} {} / {}",
                    create_progress_indicator(
                        elapsed.as_millis() as usize,
                        total.as_millis() as usize,
                        30
                    ),
                    format_millis(elapsed.as_millis() as u64),
                    format_millis(total.as_millis() as u64)
                );
                print_table(&query, &identities);
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_table(query: &MetricsQueryService, identities: &[Arc<IterationIdentity>]) {
    print_table_separator(&TABLE_WIDTHS);
    print_table_row(
        &[
            "Iteration", "Started", "Active", "Failed", "Rate", "Errors", "p50", "p95", "p99",
            "Down",
        ],
        &TABLE_WIDTHS,
    );
    print_table_separator(&TABLE_WIDTHS);

    for identity in identities {
        let metrics = query.all_latest(identity.id);
        let throughput = metrics
            .throughput
            .as_deref()
            .and_then(|s| s.as_throughput().ok());
        let total = metrics
            .duration
            .as_deref()
            .and_then(|s| s.as_duration().ok())
            .map(|d| d.component(TimingComponent::Total))
            .unwrap_or_default();
        let transfer = metrics
            .data_transmission
            .as_deref()
            .and_then(|s| s.as_data_transmission().ok());

        let label = format!("{} {}", identity.http_method, identity.iteration_name);
        let errors = throughput.map(|t| t.error_rate).unwrap_or_default();
        let row = [
            label,
            throughput.map_or(0, |t| t.requests_count).to_string(),
            throughput.map_or(0, |t| t.active_requests).to_string(),
            throughput.map_or(0, |t| t.failed_requests).to_string(),
            throughput
                .map(|t| format_request_rate(&t.requests_rate))
                .unwrap_or_default(),
            format_percent(errors),
            format_millis(total.p50_ms),
            format_millis(total.p95_ms),
            format_millis(total.p99_ms),
            transfer
                .map(|t| format_rate(t.downstream_bytes_per_second))
                .unwrap_or_default(),
        ];
        let mut cells: Vec<String> = row
            .iter()
            .zip(TABLE_WIDTHS)
            .map(|(text, width)| fit_cell(text, width))
            .collect();
        if errors > 0.1 {
            cells[ERRORS_COLUMN] = cells[ERRORS_COLUMN].red().to_string();
        }
        print_cells(&cells);
    }

    print_table_separator(&TABLE_WIDTHS);
}

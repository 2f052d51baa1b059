use anyhow::Result;
use live_load_metrics::{
    Iteration, IterationSettings, JsonLinesSink, MetricKind, MetricsConfig, MetricsRuntime,
    SnapshotExporter, TimingComponent,
};
use std::sync::Arc;
use std::time::Duration;

/// Runtime whose rate timers never fire on their own during a test.
fn quiet_runtime(history_capacity: usize) -> Result<MetricsRuntime> {
    let config = MetricsConfig {
        history_capacity,
        tick_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    Ok(MetricsRuntime::new(config)?)
}

/// Failure-coded responses are moved from successful to failed on the next
/// recompute, and the error rate follows.
#[tokio::test(start_paused = true)]
async fn response_codes_drive_error_rate() -> Result<()> {
    let runtime = quiet_runtime(256)?;
    let iteration = Iteration::new("checkout", "POST", "https://shop.test/checkout");
    let set = runtime.monitor(&iteration, "round-1")?;
    let recorder = runtime.recorder();

    for i in 0..10 {
        assert!(recorder.request_started(iteration.id));
        let (code, reason) = if i < 8 { (200, "OK") } else { (500, "Internal Server Error") };
        assert!(recorder.response(iteration.id, code, reason));
        assert!(recorder.request_completed(iteration.id, true));
    }

    // Before the recompute every completion with a response is a success
    let before = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    assert_eq!(before.as_throughput()?.successful_requests, 10);

    set.throughput.tick();

    let after = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    let throughput = after.as_throughput()?;
    assert_eq!(throughput.requests_count, 10);
    assert_eq!(throughput.active_requests, 0);
    assert_eq!(throughput.successful_requests, 8);
    assert_eq!(throughput.failed_requests, 2);
    assert!((throughput.error_rate - 0.2).abs() < 1e-9);

    let codes = runtime.query().latest(iteration.id, MetricKind::ResponseCode).unwrap();
    let codes = codes.as_response_code()?;
    assert_eq!(codes.count_of(200, "OK"), 8);
    assert_eq!(codes.count_of(500, "Internal Server Error"), 2);
    assert_eq!(codes.total(), 10);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duration_statistics_from_recorded_timings() -> Result<()> {
    let runtime = quiet_runtime(256)?;
    let iteration = Iteration::new("browse", "GET", "https://shop.test/products");
    runtime.monitor(&iteration, "round-1")?;

    for millis in [100, 200, 300, 400, 500] {
        assert!(runtime
            .recorder()
            .timing(iteration.id, TimingComponent::Total, millis));
    }
    // Unknown component names are logged and the sample is dropped
    assert!(!runtime.recorder().timing_named(iteration.id, "dns-lookup", 42));
    assert!(runtime.recorder().timing_named(iteration.id, "ttfb", 42));

    let snapshot = runtime.query().latest(iteration.id, MetricKind::Duration).unwrap();
    let total = snapshot.as_duration()?.component(TimingComponent::Total);
    assert_eq!(total.count, 5);
    assert_eq!(total.min_ms, 100);
    assert_eq!(total.max_ms, 500);
    assert_eq!(total.sum_ms, 1500);
    assert!((total.average_ms - 300.0).abs() < 1e-9);
    assert_eq!(total.p50_ms, 300);
    assert!(total.p99_ms >= total.p95_ms && total.p95_ms >= total.p90_ms);

    let waiting = snapshot.as_duration()?.component(TimingComponent::Waiting);
    assert_eq!(waiting.count, 0);
    let ttfb = snapshot.as_duration()?.component(TimingComponent::TimeToFirstByte);
    assert_eq!(ttfb.count, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn history_is_capped_oldest_first() -> Result<()> {
    let capacity = 8;
    let runtime = quiet_runtime(capacity)?;
    let iteration = Iteration::new("search", "GET", "https://shop.test/search?q=rust");
    runtime.monitor(&iteration, "round-1")?;

    // One seeded snapshot plus capacity + 1 publishes
    for _ in 0..=capacity {
        runtime.recorder().request_started(iteration.id);
    }

    let history = runtime.query().history(iteration.id, MetricKind::Throughput);
    assert_eq!(history.len(), capacity);
    assert_eq!(runtime.store().evicted(iteration.id, MetricKind::Throughput), 2);

    let counts: Vec<u64> = history
        .iter()
        .map(|s| s.as_throughput().map(|t| t.requests_count))
        .collect::<Result<_, _>>()?;
    assert_eq!(counts, (2..=9).collect::<Vec<u64>>());

    let latest = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    assert!(Arc::ptr_eq(&latest, history.last().unwrap()));
    Ok(())
}

/// Active time stops accumulating while the aggregators are stopped.
#[tokio::test(start_paused = true)]
async fn stopped_time_is_not_counted() -> Result<()> {
    let runtime = quiet_runtime(256)?;
    let iteration = Iteration::new("add-to-cart", "POST", "https://shop.test/cart/items");
    let set = runtime.monitor(&iteration, "round-1")?;

    runtime.recorder().request_started(iteration.id);
    tokio::time::advance(Duration::from_secs(2)).await;
    runtime.recorder().request_completed(iteration.id, true);

    set.stop_all()?;
    assert!(!set.is_running());
    let stopped = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    assert_eq!(stopped.as_throughput()?.elapsed_active_ms, 2000);

    tokio::time::advance(Duration::from_secs(5)).await;
    set.start_all()?;
    tokio::time::advance(Duration::from_secs(1)).await;
    set.throughput.tick();

    let resumed = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    let throughput = resumed.as_throughput()?;
    assert_eq!(throughput.elapsed_active_ms, 3000);
    assert_eq!(throughput.successful_requests, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_time_lowers_the_request_rate() -> Result<()> {
    let runtime = quiet_runtime(256)?;
    let iteration = Iteration::new("browse", "GET", "https://shop.test/products");
    let set = runtime.monitor(&iteration, "round-1")?;

    tokio::time::advance(Duration::from_secs(2)).await;
    runtime.recorder().request_started(iteration.id);
    runtime.recorder().response(iteration.id, 200, "OK");
    runtime.recorder().request_completed(iteration.id, true);
    set.throughput.tick();

    let snapshot = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    let throughput = snapshot.as_throughput()?;
    assert_eq!(throughput.requests_rate.window_ms, 1000);
    assert!((throughput.requests_rate.value - 0.5).abs() < 1e-9);
    assert!(throughput.cooldown_requests_rate.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_monitoring_creates_one_set() -> Result<()> {
    let runtime = Arc::new(quiet_runtime(256)?);
    let iteration = Arc::new(Iteration::new(
        "checkout",
        "POST",
        "https://shop.test/checkout",
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let iteration = Arc::clone(&iteration);
            tokio::spawn(async move { runtime.monitor(&iteration, "round-1") })
        })
        .collect();

    let mut sets = Vec::new();
    for handle in handles {
        sets.push(handle.await??);
    }

    assert!(sets.iter().all(|set| Arc::ptr_eq(set, &sets[0])));
    assert_eq!(runtime.factory().len(), 1);
    for kind in MetricKind::ALL {
        assert_eq!(runtime.store().history_len(iteration.id, kind), 1);
    }
    runtime.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unmonitored_iterations_drop_events() -> Result<()> {
    let runtime = quiet_runtime(256)?;
    let iteration = Iteration::new("checkout", "POST", "https://shop.test/checkout");

    assert!(!runtime.recorder().request_started(iteration.id));
    assert!(runtime.query().latest(iteration.id, MetricKind::Throughput).is_none());

    runtime.monitor(&iteration, "round-1")?;
    assert!(runtime.recorder().request_started(iteration.id));

    assert!(runtime.unmonitor(iteration.id, false));
    assert!(!runtime.recorder().request_started(iteration.id));
    // History survives unless explicitly dropped
    let last = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    assert_eq!(last.as_throughput()?.requests_count, 1);

    assert!(!runtime.unmonitor(iteration.id, true));
    assert!(runtime.query().latest(iteration.id, MetricKind::Throughput).is_none());
    Ok(())
}

/// Cooldown batch modes additionally report the rate per cooldown window.
#[tokio::test(start_paused = true)]
async fn cooldown_mode_reports_window_rate() -> Result<()> {
    let runtime = quiet_runtime(256)?;
    let settings = IterationSettings {
        mode: live_load_metrics::ExecutionMode::CooldownBatch,
        cooldown: Duration::from_secs(5),
        ..Default::default()
    };
    let iteration =
        Iteration::new("browse", "GET", "https://shop.test/products").with_settings(settings);
    let set = runtime.monitor(&iteration, "round-1")?;

    for _ in 0..50 {
        runtime.recorder().request_started(iteration.id);
        runtime.recorder().request_completed(iteration.id, true);
    }

    // Nothing is reported until a full window has elapsed
    tokio::time::advance(Duration::from_secs(4)).await;
    set.throughput.tick();
    let early = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    assert_eq!(early.as_throughput()?.cooldown_requests_rate.unwrap().value, 0.0);

    tokio::time::advance(Duration::from_secs(6)).await;
    set.throughput.tick();

    let snapshot = runtime.query().latest(iteration.id, MetricKind::Throughput).unwrap();
    let throughput = snapshot.as_throughput()?;
    assert!((throughput.requests_rate.value - 5.0).abs() < 1e-9);
    let cooldown = throughput.cooldown_requests_rate.unwrap();
    assert_eq!(cooldown.window_ms, 5000);
    assert!((cooldown.value - 25.0).abs() < 1e-9);
    Ok(())
}

/// Snapshots published after removal are still exported once.
#[tokio::test(start_paused = true)]
async fn exporter_streams_each_snapshot_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("snapshots.jsonl");

    let runtime = quiet_runtime(256)?;
    let iteration = Iteration::new("checkout", "POST", "https://shop.test/checkout");
    runtime.monitor(&iteration, "round-1")?;

    let sink = Arc::new(JsonLinesSink::create(&path).await?);
    let mut exporter = SnapshotExporter::new(runtime.query().clone()).with_sink(sink);

    assert_eq!(exporter.export_once().await, 4);
    assert_eq!(exporter.export_once().await, 0);

    runtime.recorder().request_started(iteration.id);
    runtime.recorder().sent(iteration.id, 512);
    assert_eq!(exporter.export_once().await, 2);

    runtime.shutdown();
    assert_eq!(exporter.export_once().await, 4);
    exporter.flush().await;

    let stats = exporter.stats();
    assert_eq!(stats.pushed, 10);
    assert_eq!(stats.failures, 0);

    let contents = tokio::fs::read_to_string(&path).await?;
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 10);
    Ok(())
}

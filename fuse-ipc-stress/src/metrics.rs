//! Metrics collection and reporting for fuse-ipc-stress.
//!
//! Uses the `metrics` crate with `metrics-util` for in-memory collection.
//! The engine's own `fuse_ipc.*` counters land in the same recorder.

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use metrics_util::CompositeKey;
use serde::Serialize;
use std::sync::OnceLock;

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();

/// Initialize the metrics recorder. Call once at program start.
pub fn init() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    SNAPSHOTTER.set(snapshotter).ok();
    metrics::set_global_recorder(recorder).ok();
}

struct Percentiles {
    count: usize,
    min: f64,
    avg: f64,
    p50: f64,
    p95: f64,
    p99: f64,
    max: f64,
}

fn percentiles(mut values: Vec<f64>) -> Option<Percentiles> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let count = values.len();
    let at = |q: f64| values[((count as f64 * q) as usize).min(count - 1)];
    Some(Percentiles {
        count,
        min: values[0],
        avg: values.iter().sum::<f64>() / count as f64,
        p50: at(0.50),
        p95: at(0.95),
        p99: at(0.99),
        max: values[count - 1],
    })
}

/// Recorded metrics, sorted by name.
///
/// Taking a snapshot drains histogram samples, so take one and share it.
pub type Entries = Vec<(CompositeKey, DebugValue)>;

pub fn snapshot() -> Option<Entries> {
    let snapshotter = SNAPSHOTTER.get()?;
    Some(collect(snapshotter))
}

fn collect(snapshotter: &Snapshotter) -> Entries {
    let mut entries: Entries = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, value)| (key, value))
        .collect();
    entries.sort_by(|a, b| a.0.key().name().cmp(b.0.key().name()));
    entries
}

/// Print every recorded metric to stderr.
pub fn print_snapshot(entries: &Entries) {
    eprintln!("\n=== Metrics Snapshot ===\n");

    for (key, value) in entries {
        let name = key.key().name();
        let labels: Vec<_> = key
            .key()
            .labels()
            .map(|l| format!("{}={}", l.key(), l.value()))
            .collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };

        match value {
            DebugValue::Counter(v) => eprintln!("  {name}{label_str}: {v}"),
            DebugValue::Gauge(v) => eprintln!("  {name}{label_str}: {:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                match percentiles(samples.iter().map(|v| v.into_inner()).collect()) {
                    None => eprintln!("  {name}{label_str}: (no samples)"),
                    Some(p) => eprintln!(
                        "  {name}{label_str}: count={} min={:.0} avg={:.0} p50={:.0} p95={:.0} p99={:.0} max={:.0}",
                        p.count, p.min, p.avg, p.p50, p.p95, p.p99, p.max
                    ),
                }
            }
        }
    }

    eprintln!();
}

/// Run-wide totals derived from the recorder.
#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    pub total_ops: u64,
    pub total_errors: u64,
    pub latency_avg_us: f64,
    pub latency_p99_us: f64,
    pub ops_per_sec: f64,
}

/// Calculate summary from snapshot, given elapsed time.
pub fn get_summary(entries: &Entries, elapsed_secs: f64) -> MetricsSummary {
    let mut total_ops = 0u64;
    let mut total_errors = 0u64;
    let mut latencies: Vec<f64> = Vec::new();

    for (key, value) in entries {
        match (key.key().name(), value) {
            ("stress.ops", DebugValue::Counter(v)) => total_ops += v,
            ("stress.errors", DebugValue::Counter(v)) => total_errors += v,
            ("stress.latency_us", DebugValue::Histogram(samples)) => {
                latencies.extend(samples.iter().map(|v| v.into_inner()));
            }
            _ => {}
        }
    }

    let (latency_avg_us, latency_p99_us) =
        percentiles(latencies).map_or((0.0, 0.0), |p| (p.avg, p.p99));

    let ops_per_sec = if elapsed_secs > 0.0 {
        total_ops as f64 / elapsed_secs
    } else {
        0.0
    };

    MetricsSummary {
        total_ops,
        total_errors,
        latency_avg_us,
        latency_p99_us,
        ops_per_sec,
    }
}

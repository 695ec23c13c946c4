// Harness metrics
//
// Counters, gauges and histograms for:
// - Run outcomes and classified error kinds
// - Handle lifecycle (registered, released, leaked, blocked double frees)
// - Watchdog expiries
// - Run, operation and cleanup latency

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{ErrorKind, RunOutcome};
use crate::ownership::tracker::{Transition, TransitionAction};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturate at zero; a stray dec must not wrap.
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    fn with_bounds(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds
                .iter()
                .map(|le| HistogramBucket {
                    le: *le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Standard latency buckets (seconds)
    pub fn new_latency() -> Self {
        Self::with_bounds(&[
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }

    /// Fine-grained buckets for single native calls
    pub fn new_call_latency() -> Self {
        Self::with_bounds(&[0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0])
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 1e-9)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, name: &str, help: &str, output: &mut String) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} histogram\n", name));
        for bucket in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            name,
            self.get_count()
        ));
        output.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count {}\n", name, self.get_count()));
    }
}

/// Process-wide metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    // Run outcomes
    pub runs_total: Counter,
    pub runs_success: Counter,
    pub runs_failure: Counter,
    pub active_runs: Gauge,

    // Classified errors, indexed like ErrorKind::ALL
    errors_by_kind: Vec<Counter>,

    // Native calls
    pub operations_total: Counter,
    pub watchdog_timeouts: Counter,

    // Handle lifecycle
    pub handles_registered: Counter,
    pub references_marked: Counter,
    pub handles_released: Counter,
    pub handles_leaked: Counter,
    pub double_free_blocked: Counter,

    // Latency
    pub run_duration: Histogram,
    pub operation_duration: Histogram,
    pub cleanup_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            runs_total: Counter::new(),
            runs_success: Counter::new(),
            runs_failure: Counter::new(),
            active_runs: Gauge::new(),

            errors_by_kind: ErrorKind::ALL.iter().map(|_| Counter::new()).collect(),

            operations_total: Counter::new(),
            watchdog_timeouts: Counter::new(),

            handles_registered: Counter::new(),
            references_marked: Counter::new(),
            handles_released: Counter::new(),
            handles_leaked: Counter::new(),
            double_free_blocked: Counter::new(),

            run_duration: Histogram::new_latency(),
            operation_duration: Histogram::new_call_latency(),
            cleanup_duration: Histogram::new_latency(),
        }
    }

    fn kind_index(kind: ErrorKind) -> usize {
        ErrorKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(ErrorKind::ALL.len() - 1)
    }

    /// Record a finished run
    pub fn record_run(&self, outcome: RunOutcome, duration: Duration) {
        self.runs_total.inc();
        match outcome {
            RunOutcome::Success => self.runs_success.inc(),
            RunOutcome::Failure => self.runs_failure.inc(),
        }
        self.run_duration.observe(duration);
    }

    /// Record one classified error
    pub fn record_error(&self, kind: ErrorKind) {
        if let Some(counter) = self.errors_by_kind.get(Self::kind_index(kind)) {
            counter.inc();
        }
        if kind == ErrorKind::Timeout {
            self.watchdog_timeouts.inc();
        }
    }

    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind
            .get(Self::kind_index(kind))
            .map(Counter::get)
            .unwrap_or(0)
    }

    pub fn record_operation(&self, duration: Duration) {
        self.operations_total.inc();
        self.operation_duration.observe(duration);
    }

    /// Fold a run's ownership journal into the lifecycle counters
    pub fn record_ownership(&self, journal: &[Transition]) {
        for transition in journal {
            match transition.action {
                TransitionAction::Register => self.handles_registered.inc(),
                TransitionAction::Reference => self.references_marked.inc(),
                TransitionAction::Release | TransitionAction::CascadeRelease => {
                    self.handles_released.inc()
                }
                TransitionAction::Leak => self.handles_leaked.inc(),
                TransitionAction::DoubleFreeBlocked => self.double_free_blocked.inc(),
                _ => {}
            }
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP seqbox_runs_total Total number of scripted runs\n");
        output.push_str("# TYPE seqbox_runs_total counter\n");
        output.push_str(&format!("seqbox_runs_total {}\n", self.runs_total.get()));

        output.push_str("# HELP seqbox_runs_by_outcome Runs by terminal outcome\n");
        output.push_str("# TYPE seqbox_runs_by_outcome counter\n");
        output.push_str(&format!(
            "seqbox_runs_by_outcome{{outcome=\"success\"}} {}\n",
            self.runs_success.get()
        ));
        output.push_str(&format!(
            "seqbox_runs_by_outcome{{outcome=\"failure\"}} {}\n",
            self.runs_failure.get()
        ));

        output.push_str("# HELP seqbox_active_runs Runs currently executing\n");
        output.push_str("# TYPE seqbox_active_runs gauge\n");
        output.push_str(&format!("seqbox_active_runs {}\n", self.active_runs.get()));

        output.push_str("# HELP seqbox_errors_total Classified errors by kind\n");
        output.push_str("# TYPE seqbox_errors_total counter\n");
        for (kind, counter) in ErrorKind::ALL.iter().zip(&self.errors_by_kind) {
            output.push_str(&format!(
                "seqbox_errors_total{{kind=\"{}\"}} {}\n",
                kind,
                counter.get()
            ));
        }

        output.push_str("# HELP seqbox_operations_total Native calls issued\n");
        output.push_str("# TYPE seqbox_operations_total counter\n");
        output.push_str(&format!(
            "seqbox_operations_total {}\n",
            self.operations_total.get()
        ));

        output.push_str("# HELP seqbox_handles_total Handle lifecycle events\n");
        output.push_str("# TYPE seqbox_handles_total counter\n");
        for (event, counter) in [
            ("registered", &self.handles_registered),
            ("referenced", &self.references_marked),
            ("released", &self.handles_released),
            ("leaked", &self.handles_leaked),
            ("double_free_blocked", &self.double_free_blocked),
        ] {
            output.push_str(&format!(
                "seqbox_handles_total{{event=\"{}\"}} {}\n",
                event,
                counter.get()
            ));
        }

        self.run_duration.export(
            "seqbox_run_duration_seconds",
            "Wall time of a whole run",
            &mut output,
        );
        self.cleanup_duration.export(
            "seqbox_cleanup_duration_seconds",
            "Wall time of the cleanup phase and drain",
            &mut output,
        );
        self.operation_duration.export(
            "seqbox_operation_duration_seconds",
            "Wall time of one native call",
            &mut output,
        );

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

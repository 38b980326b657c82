/*!
Metric definitions for the sandbox module.
*/

use std::time::Instant;

// Gauge, workers currently alive.
pub(crate) static METRIC_ACTIVE_WORKERS: &str = "active_sandbox_workers";

// Counters over the lifetime of the process.
pub(crate) static METRIC_RUNS_TOTAL: &str = "sandbox_runs_total";
pub(crate) static METRIC_RUN_TIMEOUTS: &str = "sandbox_run_timeouts_total";
pub(crate) static METRIC_ANALYSIS_REJECTIONS: &str = "sandbox_analysis_rejections_total";
pub(crate) static METRIC_ADAPTER_CALLS: &str = "sandbox_adapter_calls_total";

// Histogram, wall-clock per worker phase.
pub(crate) static METRIC_WORKER_DURATION: &str = "sandbox_worker_duration_microseconds";

/// RAII guard tracking one worker's lifetime in the metrics.
pub(crate) struct WorkerMetricsGuard {
    started: Instant,
}

impl WorkerMetricsGuard {
    pub(crate) fn new() -> Self {
        metrics::gauge!(METRIC_ACTIVE_WORKERS).increment(1);
        Self {
            started: Instant::now(),
        }
    }
}

impl Drop for WorkerMetricsGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_WORKERS).decrement(1);
        metrics::histogram!(METRIC_WORKER_DURATION)
            .record(self.started.elapsed().as_micros() as f64);
    }
}

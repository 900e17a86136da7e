// Process-wide Prometheus metrics for the execution engine
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "solver_executions_total",
        "Submissions handled, by outcome",
        &["outcome"]
    )
    .expect("metric registration");
    pub static ref EXECUTION_SECONDS: Histogram = register_histogram!(
        "solver_execution_seconds",
        "Wall time of submissions that reached a worker",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("metric registration");
    pub static ref WORKERS_STARTED: IntCounter = register_int_counter!(
        "solver_workers_started_total",
        "Interpreter workers that completed their preamble"
    )
    .expect("metric registration");
    pub static ref WORKER_REPLACEMENTS: IntCounter = register_int_counter!(
        "solver_worker_replacements_total",
        "Workers torn down after a timeout or crash"
    )
    .expect("metric registration");
    pub static ref LIVE_WORKERS: IntGauge = register_int_gauge!(
        "solver_live_workers",
        "Interpreter workers currently alive"
    )
    .expect("metric registration");
    pub static ref SESSIONS_REAPED: IntCounter = register_int_counter!(
        "solver_sessions_reaped_total",
        "Idle sessions removed by the reaper"
    )
    .expect("metric registration");
    pub static ref ADMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "solver_admissions_total",
        "File admission decisions, by outcome",
        &["outcome"]
    )
    .expect("metric registration");
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

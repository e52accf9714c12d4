//! Prometheus metrics for the rebalancer
//!
//! Exposes job outcomes, step counts and ideal state write contention.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::job::RebalanceStatus;

/// Metric names as constants
pub mod names {
    pub const REBALANCE_TOTAL: &str = "tessera_rebalance_total";
    pub const REBALANCE_DURATION: &str = "tessera_rebalance_duration_seconds";
    pub const REBALANCE_STEPS: &str = "tessera_rebalance_steps_total";
    pub const SEGMENTS_UPDATED: &str = "tessera_rebalance_segments_updated_total";
    pub const IDEAL_STATE_CONFLICTS: &str = "tessera_rebalance_ideal_state_conflicts_total";
    pub const PRE_CHECK_ERRORS: &str = "tessera_rebalance_pre_check_errors_total";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(
        names::REBALANCE_TOTAL,
        "Rebalance jobs finished, by status"
    );
    describe_histogram!(
        names::REBALANCE_DURATION,
        "Wall-clock duration of rebalance jobs in seconds"
    );
    describe_counter!(
        names::REBALANCE_STEPS,
        "Ideal state steps written by rebalance jobs"
    );
    describe_counter!(
        names::SEGMENTS_UPDATED,
        "Segments whose instance state map changed in a rebalance step"
    );
    describe_counter!(
        names::IDEAL_STATE_CONFLICTS,
        "Ideal state compare-and-set version conflicts"
    );
    describe_counter!(
        names::PRE_CHECK_ERRORS,
        "Pre-checks that ended in ERROR"
    );
}

/// Install the Prometheus exporter with an HTTP listener
pub fn install_exporter(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    init_metrics();
    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_result(table: &str, status: RebalanceStatus, duration: Duration) {
    counter!(names::REBALANCE_TOTAL, "table" => table.to_string(), "status" => status.to_string()).increment(1);
    histogram!(names::REBALANCE_DURATION, "table" => table.to_string()).record(duration.as_secs_f64());
}

pub fn record_step(table: &str, segments_updated: usize) {
    counter!(names::REBALANCE_STEPS, "table" => table.to_string()).increment(1);
    counter!(names::SEGMENTS_UPDATED, "table" => table.to_string()).increment(segments_updated as u64);
}

pub fn record_ideal_state_conflict() {
    counter!(names::IDEAL_STATE_CONFLICTS).increment(1);
}

pub fn record_pre_check_error(check: &'static str) {
    counter!(names::PRE_CHECK_ERRORS, "check" => check).increment(1);
}

//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Settlement runs and step latency
//! - Observed events and transactions
//! - Confirmation and relay activity

use crate::error::{SettlementError, SettlementResult};
use crate::events::ContractEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "settler_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "settler_chain_block_height",
        "Latest block height seen per chain",
        &["chain"]
    ).unwrap();

    // Run metrics
    pub static ref RUNS_STARTED: CounterVec = register_counter_vec!(
        "settler_runs_started_total",
        "Total settlement runs started",
        &["mode"]
    ).unwrap();

    pub static ref RUNS_FINISHED: CounterVec = register_counter_vec!(
        "settler_runs_finished_total",
        "Total settlement runs finished by outcome",
        &["mode", "outcome"]
    ).unwrap();

    pub static ref STEP_LATENCY: HistogramVec = register_histogram_vec!(
        "settler_step_latency_seconds",
        "Time from step running to its terminal status",
        &["step"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref OBSERVATION_TIMEOUTS: CounterVec = register_counter_vec!(
        "settler_observation_timeouts_total",
        "Observations that ended without a matching event",
        &["step"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "settler_events_observed_total",
        "Total contract events matched by the watcher",
        &["event_type"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "settler_transactions_submitted_total",
        "Total transactions submitted",
        &["chain"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "settler_transactions_failed_total",
        "Total transactions rejected or reverted",
        &["chain"]
    ).unwrap();

    // Session metrics
    pub static ref PENDING_CONFIRMATIONS: Gauge = register_gauge!(
        "settler_pending_confirmations",
        "Sessions waiting for a checkout confirmation"
    ).unwrap();

    // Relay metrics
    pub static ref RELAYED_STREAMS: CounterVec = register_counter_vec!(
        "settler_relayed_streams_total",
        "Upstream settlement streams relayed by status",
        &["status"]
    ).unwrap();

    pub static ref RELAYED_EVENTS: CounterVec = register_counter_vec!(
        "settler_relayed_events_total",
        "Events seen while relaying an upstream stream",
        &["event"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "settler_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "settler_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SettlementResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SettlementError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SettlementError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

/// Render the default registry in the text exposition format
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain: &str, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain])
        .set(block_number as f64);
}

pub fn record_run_started(mode: &str) {
    RUNS_STARTED.with_label_values(&[mode]).inc();
}

pub fn record_run_finished(mode: &str, outcome: &str) {
    RUNS_FINISHED.with_label_values(&[mode, outcome]).inc();
}

pub fn record_step_latency(step: &str, latency_secs: f64) {
    STEP_LATENCY.with_label_values(&[step]).observe(latency_secs);
}

pub fn record_observation_timeout(step: &str) {
    OBSERVATION_TIMEOUTS.with_label_values(&[step]).inc();
}

pub fn record_event(event: &ContractEvent) {
    EVENTS_OBSERVED.with_label_values(&[event.name()]).inc();
}

pub fn record_tx_submitted(chain: &str) {
    TX_SUBMITTED.with_label_values(&[chain]).inc();
}

pub fn record_tx_failed(chain: &str) {
    TX_FAILED.with_label_values(&[chain]).inc();
}

pub fn set_pending_confirmations(count: usize) {
    PENDING_CONFIRMATIONS.set(count as f64);
}

pub fn record_relayed_stream(status: u16) {
    RELAYED_STREAMS
        .with_label_values(&[&status.to_string()])
        .inc();
}

pub fn record_relayed_event(event: &str) {
    RELAYED_EVENTS.with_label_values(&[event]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_run_started("simulate");
        record_tx_submitted("base-sepolia");

        let text = render().unwrap();
        assert!(text.contains("settler_runs_started_total"));
        assert!(text.contains("base-sepolia"));
    }
}

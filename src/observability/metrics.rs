//! Metrics collection and exposition.
//!
//! # Metrics
//! - `settlement_tx_total` (counter): settled intents by kind and final status
//! - `settlement_drain_duration_seconds` (histogram): drain pass latency
//! - `settlement_queue_depth` (gauge): queued intents seen at drain start
//! - `claim_requests_total` (counter): claim attempts by outcome
//! - `chain_rpc_healthy` (gauge): 1=healthy, 0=unhealthy
//!
//! Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// One intent reached a terminal status.
pub fn record_settlement(kind: &str, status: &str) {
    counter!(
        "settlement_tx_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// A drain pass finished.
pub fn record_drain(start: Instant, queue_depth: i64) {
    histogram!("settlement_drain_duration_seconds").record(start.elapsed().as_secs_f64());
    gauge!("settlement_queue_depth").set(queue_depth as f64);
}

/// A claim attempt was audited.
pub fn record_claim(outcome: &str) {
    counter!("claim_requests_total", "outcome" => outcome.to_string()).increment(1);
}

/// Result of the latest chain health probe.
pub fn record_chain_health(healthy: bool) {
    gauge!("chain_rpc_healthy").set(if healthy { 1.0 } else { 0.0 });
}

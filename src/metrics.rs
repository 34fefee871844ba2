//! Prometheus metrics for the AgentMesh Bridge
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, register_int_gauge, CounterVec,
    Encoder, Gauge, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    // Task lifecycle metrics
    pub static ref TASKS_SUBMITTED: IntCounter = register_int_counter!(
        "bridge_tasks_submitted_total",
        "Total number of tasks accepted for execution"
    ).unwrap();

    pub static ref TASKS_FINISHED: CounterVec = register_counter_vec!(
        "bridge_tasks_finished_total",
        "Total number of tasks finished, by terminal status",
        &["status"]
    ).unwrap();

    pub static ref TASKS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "bridge_tasks_in_flight",
        "Number of tasks currently pending execution"
    ).unwrap();

    // Auth and limiting metrics
    pub static ref AUTH_FAILURES: CounterVec = register_counter_vec!(
        "bridge_auth_failures_total",
        "Total number of rejected authentication attempts",
        &["reason"]
    ).unwrap();

    pub static ref RATE_LIMITED: IntCounter = register_int_counter!(
        "bridge_rate_limited_total",
        "Total number of requests denied by the free-tier limiter"
    ).unwrap();

    // Escrow metrics
    pub static ref ESCROW_VALIDATIONS: CounterVec = register_counter_vec!(
        "bridge_escrow_validations_total",
        "Total number of escrow validations, by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref DELIVERY_CONFIRMATIONS: CounterVec = register_counter_vec!(
        "bridge_delivery_confirmations_total",
        "Total number of delivery confirmations submitted, by outcome",
        &["outcome"]
    ).unwrap();

    // Connection metrics
    pub static ref WS_CONNECTIONS: IntGauge = register_int_gauge!(
        "bridge_ws_connections",
        "Number of open WebSocket connections"
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "bridge_up",
        "Whether the bridge is up and running"
    ).unwrap();
}

/// Encode all registered metrics in Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        TASKS_SUBMITTED.inc();
        UP.set(1.0);
        let text = render();
        assert!(text.contains("bridge_tasks_submitted_total"));
        assert!(text.contains("bridge_up"));
    }
}

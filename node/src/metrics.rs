//! # Prometheus Metrics
//!
//! Operational metrics for the consensus node, scraped from the
//! `/metrics` endpoint on the metrics port.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] so they do
//! not collide with any default global registry consumers. Gauges that
//! mirror core state are refreshed by a background sampler task in
//! `main.rs`.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Registry that owns all metrics below.
    registry: Registry,
    /// Transactions accepted at ingress.
    pub transactions_submitted_total: IntCounter,
    /// Transactions promoted to FINALIZED.
    pub transactions_finalized_total: IntCounter,
    /// Appeals opened.
    pub appeals_total: IntCounter,
    /// JSON-RPC requests refused by the rate limiter.
    pub rpc_rate_limited_total: IntCounter,
    /// Transactions currently PENDING.
    pub transactions_pending: IntGauge,
    /// Transactions queued for dispatch.
    pub transactions_queued: IntGauge,
    /// Workers currently driving a transaction.
    pub workers_busy: IntGauge,
    /// Registered validators.
    pub validators_registered: IntGauge,
    /// Live event-bus subscribers.
    pub event_subscribers: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("conclave".into()), None)
            .expect("failed to create prometheus registry");

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let metric = IntCounter::new(name, help).expect("metric creation");
            registry
                .register(Box::new(metric.clone()))
                .expect("metric registration");
            metric
        }

        fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let metric = IntGauge::new(name, help).expect("metric creation");
            registry
                .register(Box::new(metric.clone()))
                .expect("metric registration");
            metric
        }

        Self {
            transactions_submitted_total: counter(
                &registry,
                "transactions_submitted_total",
                "Transactions accepted at ingress",
            ),
            transactions_finalized_total: counter(
                &registry,
                "transactions_finalized_total",
                "Transactions promoted to FINALIZED",
            ),
            appeals_total: counter(&registry, "appeals_total", "Appeals opened"),
            rpc_rate_limited_total: counter(
                &registry,
                "rpc_rate_limited_total",
                "JSON-RPC requests refused by the rate limiter",
            ),
            transactions_pending: gauge(
                &registry,
                "transactions_pending",
                "Transactions currently in PENDING",
            ),
            transactions_queued: gauge(
                &registry,
                "transactions_queued",
                "Transactions queued for dispatch",
            ),
            workers_busy: gauge(
                &registry,
                "workers_busy",
                "Workers currently driving a transaction",
            ),
            validators_registered: gauge(
                &registry,
                "validators_registered",
                "Validators in the registry",
            ),
            event_subscribers: gauge(
                &registry,
                "event_subscribers",
                "Live event-bus subscribers",
            ),
            registry,
        }
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("failed to encode metrics: {}", e);
        }
        buffer
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics.encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let metrics = NodeMetrics::new();
        metrics.transactions_submitted_total.inc();
        metrics.transactions_pending.set(3);

        let text = String::from_utf8(metrics.encode()).unwrap();
        assert!(text.contains("conclave_transactions_submitted_total 1"));
        assert!(text.contains("conclave_transactions_pending 3"));
    }

    #[test]
    fn namespaced_metric_names() {
        let metrics = NodeMetrics::new();
        let text = String::from_utf8(metrics.encode()).unwrap();
        assert!(text.contains("conclave_workers_busy"));
        assert!(text.contains("conclave_validators_registered"));
    }
}

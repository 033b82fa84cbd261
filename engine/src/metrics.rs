//! Prometheus metrics for the reservation engine.
//!
//! Metric collection covers lock acquisition (per strategy and outcome),
//! reservations (per outcome and product), node failures, compensations,
//! and reconciliations. Contention is recorded per product: during a drop
//! that is the granularity an operator watches.
//!
//! # Example
//!
//! ```rust,no_run
//! use hotdrop_engine::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the metrics exporter.
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the metrics exporter.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, started: false }
    }

    /// Register metric descriptions and start the exporter's HTTP
    /// listener.
    ///
    /// # Errors
    ///
    /// Returns an error when the exporter cannot be built or installed.
    /// A recorder that is already installed (as happens across tests) is
    /// tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install() {
            Ok(()) => {
                self.started = true;
                tracing::info!(addr = %self.addr, "Metrics server started");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("already") {
                    tracing::warn!("Metrics recorder already installed, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            }
        }
    }

    /// Whether this instance installed the exporter.
    #[must_use]
    pub const fn started(&self) -> bool {
        self.started
    }
}

/// Register descriptions for all engine metrics.
pub fn register_metrics() {
    describe_counter!(
        "hotdrop_reservations_total",
        "Reservation attempts by outcome (success, busy, insufficient, inconsistent, error)"
    );
    describe_counter!(
        "hotdrop_lock_acquire_total",
        "Lock acquisition rounds by strategy and outcome"
    );
    describe_counter!(
        "hotdrop_lock_contention_total",
        "Acquisition rounds that found the lock busy, per product"
    );
    describe_counter!(
        "hotdrop_node_errors_total",
        "Coordination node RPC failures, per node"
    );
    describe_counter!(
        "hotdrop_compensations_total",
        "Compensating increments issued, per product and outcome"
    );
    describe_counter!(
        "hotdrop_reconciliations_total",
        "Reconciliation events scheduled, per product"
    );
    describe_histogram!(
        "hotdrop_lock_acquire_duration_seconds",
        "Wall time of a successful lock acquisition round"
    );
    describe_histogram!(
        "hotdrop_critical_section_duration_seconds",
        "Wall time between lock acquisition and release"
    );
    describe_histogram!(
        "hotdrop_lock_validity_seconds",
        "Drift-compensated validity of held quorum locks"
    );
    describe_gauge!(
        "hotdrop_nodes_configured",
        "Number of configured coordination nodes"
    );
}

//! Prometheus metrics for observability and monitoring.
//!
//! Every component records through the `metrics` facade; nothing is exported
//! unless a recorder is installed. [`MetricsServer`] installs the Prometheus
//! recorder and renders the scrape body.
//!
//! # Example
//!
//! ```rust,no_run
//! use maprelay_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

pub use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    /// Breaker state changes, labelled `breaker` and `to`
    pub const BREAKER_TRANSITIONS: &str = "maprelay_circuit_breaker_transitions_total";
    /// Calls rejected by an open breaker, labelled `breaker`
    pub const BREAKER_REJECTIONS: &str = "maprelay_circuit_breaker_rejections_total";
    /// Requests rejected by the rate limiter, labelled `preset`
    pub const RATE_LIMIT_REJECTIONS: &str = "maprelay_rate_limit_rejections_total";
    /// Live rate-limit windows
    pub const RATE_LIMIT_WINDOWS: &str = "maprelay_rate_limit_windows";
    /// Batch items by `outcome` (`successful`/`failed`)
    pub const BATCH_ITEMS: &str = "maprelay_batch_items_total";
    /// Webhook deliveries by `outcome` (`delivered`/`rejected`/`exhausted`)
    pub const WEBHOOK_DELIVERIES: &str = "maprelay_webhook_deliveries_total";
    /// Map status changes, labelled `to`
    pub const MAP_TRANSITIONS: &str = "maprelay_map_transitions_total";
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder handle.
///
/// Installs the recorder and renders the scrape body. It does not bind a
/// socket: the host application serves [`render`](Self::render) on
/// [`addr`](Self::addr) from its own HTTP router.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the host should serve the scrape route on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the host should serve the scrape route on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::Install` if the recorder cannot be installed for a
    /// reason other than one already being present.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        names::BREAKER_TRANSITIONS,
        "Circuit breaker state transitions"
    );
    describe_counter!(
        names::BREAKER_REJECTIONS,
        "Calls rejected without I/O because the circuit was open"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS,
        "Requests rejected by the rate limiter"
    );
    describe_gauge!(
        names::RATE_LIMIT_WINDOWS,
        "Rate-limit windows currently tracked"
    );
    describe_counter!(
        names::BATCH_ITEMS,
        "Items written or deleted by the batch executor, by outcome"
    );
    describe_counter!(
        names::WEBHOOK_DELIVERIES,
        "Webhook deliveries, by outcome"
    );
    describe_counter!(names::MAP_TRANSITIONS, "Map status transitions");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn start_is_idempotent() {
        let mut first = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        let mut second = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(first.start().is_ok());
        assert!(second.start().is_ok());

        counter!(names::BATCH_ITEMS, "outcome" => "successful").increment(3);

        // Only the server that won the install race renders.
        if let Some(rendered) = first.render().or_else(|| second.render()) {
            assert!(rendered.contains(names::BATCH_ITEMS));
        }
    }
}

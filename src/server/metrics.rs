//! Prometheus metrics for the relay server.
//!
//! The counters are recorded through the `metrics` facade. Until a recorder
//! is installed (the server binary does so at startup) they are no-ops.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Metric names used throughout the server.
pub mod names {
    /// Number of sessions currently registered.
    pub const CONNECTED_CLIENTS: &str = "tunnel_server_connected_clients";
    /// Total sessions ever created.
    pub const TOTAL_CREATED_TUNNELS: &str = "tunnel_server_total_created_tunnels";
    /// Sessions created with the subdomain the client asked for.
    pub const TOTAL_CUSTOM_SUBDOMAIN_TUNNELS: &str =
        "tunnel_server_total_created_custom_subdomain_tunnels";
    /// Public requests routed into a tunnel.
    pub const TOTAL_TUNNELED_REQUESTS: &str = "tunnel_server_total_tunneled_requests";
}

/// Installs the global Prometheus recorder and returns the render handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub mod record {
    use metrics::{counter, gauge};

    use super::names;

    pub fn tunnel_created() {
        counter!(names::TOTAL_CREATED_TUNNELS).increment(1);
    }

    pub fn custom_subdomain_granted() {
        counter!(names::TOTAL_CUSTOM_SUBDOMAIN_TUNNELS).increment(1);
    }

    pub fn client_connected() {
        gauge!(names::CONNECTED_CLIENTS).increment(1.0);
    }

    pub fn client_removed() {
        gauge!(names::CONNECTED_CLIENTS).decrement(1.0);
    }

    pub fn request_tunneled() {
        counter!(names::TOTAL_TUNNELED_REQUESTS).increment(1);
    }
}

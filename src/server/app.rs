use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;

use crate::server::config::ServerOptions;
use crate::server::handlers::{api_routes, dispatch, serve_public, HostRouter};
use crate::server::registry::SessionRegistry;

/// Shared state behind every public connection and API handler.
#[derive(Clone)]
pub struct AppState {
    registry: SessionRegistry,
    hosts: Arc<HostRouter>,
    secure: bool,
    metrics: Option<PrometheusHandle>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn hosts(&self) -> &HostRouter {
        &self.hosts
    }

    /// Scheme of the public URLs handed to clients.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    pub fn metrics(&self) -> Option<&PrometheusHandle> {
        self.metrics.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// The relay server: management API plus public traffic, on one listener.
pub struct TunnelServer {
    state: AppState,
}

impl TunnelServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            state: AppState {
                registry: SessionRegistry::new(options.registry),
                hosts: Arc::new(HostRouter::new(options.domain)),
                secure: options.secure,
                metrics: None,
                started_at: Utc::now(),
            },
        }
    }

    /// Serves `GET /api/metrics` from `handle`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.state.registry
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Host dispatch in front of the management API. Every request passes
    /// the dispatch layer before any API route is matched.
    pub fn router(&self) -> Router {
        let api = api_routes().with_state(self.state.clone());
        Router::new()
            .fallback_service(api)
            .layer(from_fn_with_state(self.state.clone(), dispatch))
    }

    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let app = self.router();
        serve_public(listener, self.state, app).await
    }
}

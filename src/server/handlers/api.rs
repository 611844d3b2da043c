//! Management API: tunnel registration, status and metrics.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::common::types::{NewClientResponse, TunnelStatus};
use crate::server::app::AppState;
use crate::server::handlers::host::request_host;
use crate::server::registry::RegistryError;
use crate::server::utils::{cpu_usage, is_valid_subdomain, memory_usage, CpuUsage, MemoryUsage};

const INVALID_SUBDOMAIN: &str =
    "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    NotFound(&'static str),
    Registry(RegistryError),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Registry(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Registry(e) => {
                error!("failed to create tunnel: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create tunnel").into_response()
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub tunnels: usize,
    pub mem: MemoryUsage,
    pub cpu: CpuUsage,
    pub started_at: DateTime<Utc>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/status", get(server_status))
        .route("/api/tunnels", post(create_tunnel))
        .route("/api/tunnels/:id", post(create_named_tunnel))
        .route("/api/tunnels/:id/status", get(tunnel_status))
        .route("/api/metrics", get(render_metrics))
}

async fn server_status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(ServerStatus {
        tunnels: state.registry().tunnel_count(),
        mem: memory_usage(),
        cpu: cpu_usage(),
        started_at: state.started_at(),
    })
}

async fn tunnel_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelStatus>, ApiError> {
    let session = state.registry().get(&id).ok_or(ApiError::NotFound("Tunnel not found"))?;
    Ok(Json(TunnelStatus {
        connected_sockets: session.stats().connected_sockets,
    }))
}

async fn create_tunnel(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<NewClientResponse>, ApiError> {
    new_tunnel(&state, &headers, None).await
}

async fn create_named_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NewClientResponse>, ApiError> {
    if !is_valid_subdomain(&id) {
        return Err(ApiError::BadRequest(INVALID_SUBDOMAIN));
    }
    new_tunnel(&state, &headers, Some(&id)).await
}

async fn new_tunnel(
    state: &AppState,
    headers: &HeaderMap,
    requested: Option<&str>,
) -> Result<Json<NewClientResponse>, ApiError> {
    let host = request_host(headers).ok_or(ApiError::BadRequest("Host header is required"))?;
    let result = state.registry().create_session(requested).await?;
    let url = format!("{}://{}.{}", state.scheme(), result.id, host);
    Ok(Json(NewClientResponse::from_result(result, url)))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.metrics() {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are not enabled").into_response(),
    }
}

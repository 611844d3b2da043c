use axum::http::{header, HeaderMap, StatusCode};
use axum::{routing::get, Json, Router};
use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use tracing::info;

use tunnel_relay::common::logging::init_tracing;

/// 데모용 로컬 HTTP 서버
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, short = 'p', default_value_t = 3000)]
    port: u16,
}

// API 응답을 위한 구조체
#[derive(Serialize)]
struct HealthCheckResponse {
    status: String,
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(false);
    let args = Args::parse();

    let app = Router::new()
        .route("/health", get(health_check_handler))
        .fallback(echo_host_handler);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    info!("Server running on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

// 헬스 체크 핸들러 함수
async fn health_check_handler() -> (StatusCode, Json<HealthCheckResponse>) {
    let response = HealthCheckResponse {
        status: "ok".to_string(),
        message: "Server is healthy".to_string(),
    };
    (StatusCode::OK, Json(response))
}

/// Answers with the `Host` header it received, to check Host rewriting.
async fn echo_host_handler(headers: HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    format!("Host: {}\n", host)
}

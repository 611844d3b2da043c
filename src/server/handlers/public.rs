//! Public listener: routes inbound web traffic to tunnels by hostname.

use std::net::SocketAddr;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::common::errors::is_connection_error;
use crate::common::http_conn::{is_upgrade_head, HttpRequestParser, RequestHead, Rewind};
use crate::server::app::AppState;
use crate::server::handlers::host::request_host;
use crate::server::metrics::record;
use crate::server::proxy::{forward_raw_upgrade, forward_request};

const SNIFF_CHUNK: usize = 4096;

/// Accepts public connections until the listener fails.
pub async fn serve_public(listener: TcpListener, state: AppState, app: Router) -> std::io::Result<()> {
    info!("public listener on {}", listener.local_addr()?);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on new connection: {}", e);
                }
                let state = state.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    handle_public_connection(state, app, stream, peer).await;
                });
            }
            Err(e) if is_connection_error(&e) => {
                debug!("public accept aborted: {}", e);
            }
            Err(e) => {
                error!("Failed to accept public connection: {}", e);
            }
        }
    }
}

/// Reads the first request head to tell a raw upgrade from plain HTTP.
///
/// Upgrades that open a connection are relayed byte for byte; everything
/// else is served by hyper with the head replayed in front of the stream.
pub async fn handle_public_connection(state: AppState, app: Router, mut stream: TcpStream, peer: SocketAddr) {
    let mut parser = HttpRequestParser::new();
    let mut chunk = [0u8; SNIFF_CHUNK];

    let head = loop {
        match stream.read(&mut chunk).await {
            Ok(0) if parser.get_buffer().is_empty() => return,
            Ok(0) => break None,
            Ok(n) => {
                parser.extend(&chunk[..n]);
                match parser.parse() {
                    Ok(Some(head)) => break Some(head),
                    Ok(None) => continue,
                    // Let hyper answer the malformed request.
                    Err(_) => break None,
                }
            }
            Err(e) => {
                debug!(%peer, "public connection failed before a request: {}", e);
                return;
            }
        }
    };

    match head {
        Some(head) if is_upgrade_head(&head) => {
            let mut buffered = parser.into_buffer();
            let leftover = buffered.split_off(head.len).freeze();
            dispatch_raw_upgrade(&state, head, stream, leftover).await;
        }
        _ => {
            let io = TokioIo::new(Rewind::new(parser.into_buffer().freeze(), stream));
            let service = TowerToHyperService::new(app);
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!(%peer, "public connection ended: {}", e);
            }
        }
    }
}

async fn dispatch_raw_upgrade(state: &AppState, head: RequestHead, stream: TcpStream, leftover: Bytes) {
    let session = head
        .host()
        .and_then(|host| state.hosts().client_id(host))
        .and_then(|id| state.registry().get(&id));

    match session {
        Some(session) => {
            record::request_tunneled();
            forward_raw_upgrade(session, head, stream, leftover).await;
        }
        None => {
            debug!(host = ?head.host(), "no tunnel for upgrade, closing socket");
            drop(stream);
        }
    }
}

/// Sends requests for a tunnel subdomain through that tunnel and lets
/// everything else reach the management API.
pub async fn dispatch(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let client_id = match request_host(req.headers()) {
        Some(host) => state.hosts().client_id(host),
        None => return (StatusCode::BAD_REQUEST, "Host header is required").into_response(),
    };

    let Some(client_id) = client_id else {
        return next.run(req).await;
    };

    match state.registry().get(&client_id) {
        Some(session) => {
            record::request_tunneled();
            forward_request(&session, req).await
        }
        None => (StatusCode::NOT_FOUND, "404").into_response(),
    }
}

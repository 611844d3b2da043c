//! Relays public requests through a session's pooled sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::common::errors::is_peer_churn;
use crate::common::http_conn::{is_upgrade_request, serialize_upgrade_head, RequestHead};
use crate::common::relay::{splice, RELAY_BUFFER_SIZE};
use crate::server::session::ClientSession;
use crate::server::socket_pool::{PoolError, PooledSocket};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("tunnel http error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl ForwardError {
    /// Failures caused by a client or link simply going away.
    fn is_churn(&self) -> bool {
        match self {
            ForwardError::Pool(PoolError::Closed) => true,
            ForwardError::Pool(_) => false,
            ForwardError::Hyper(e) => {
                if e.is_canceled() || e.is_incomplete_message() || e.is_closed() {
                    return true;
                }
                let mut source = std::error::Error::source(e);
                while let Some(inner) = source {
                    if let Some(io) = inner.downcast_ref::<std::io::Error>() {
                        return is_peer_churn(io);
                    }
                    source = inner.source();
                }
                false
            }
        }
    }
}

fn log_forward_error(client_id: &str, path: &str, e: &ForwardError) {
    if e.is_churn() {
        debug!(client_id, "request {} dropped: {}", path, e);
    } else {
        error!(client_id, "failed to forward {}: {}", path, e);
    }
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
}

/// Forwards one HTTP request through a pooled socket and returns the
/// tunnel client's response.
///
/// Upgrade requests arriving here (a later request on a keep-alive public
/// connection) are spliced once both sides have switched protocols.
pub async fn forward_request(session: &ClientSession, req: Request) -> Response {
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    debug!(client_id = %session.id(), "> {}", path);

    match try_forward(session, req).await {
        Ok(resp) => {
            debug!(client_id = %session.id(), "< {} {}", path, resp.status());
            resp
        }
        Err(e) => {
            log_forward_error(session.id(), &path, &e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn try_forward(session: &ClientSession, mut req: Request) -> Result<Response, ForwardError> {
    let upgrade = is_upgrade_request(req.headers());
    let inbound_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));
    let request_allows_reuse = !upgrade && req.version() == Version::HTTP_11 && !wants_close(req.headers());

    let socket = session.pool().acquire().await?;
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake::<_, Body>(TokioIo::new(socket))
        .await?;

    let reusable = Arc::new(AtomicBool::new(false));
    if upgrade {
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("tunnel upgrade connection ended: {}", e);
            }
        });
    } else {
        let pool = session.pool().clone();
        let reusable = reusable.clone();
        tokio::spawn(async move {
            match conn.without_shutdown().await {
                Ok(parts) if parts.read_buf.is_empty() && reusable.load(Ordering::SeqCst) => {
                    pool.release(parts.io.into_inner());
                }
                Ok(_) => {}
                Err(e) => debug!("tunnel connection ended: {}", e),
            }
        });
    }

    let mut resp = sender.send_request(req).await?;
    if inbound_upgrade.is_none() {
        reusable.store(request_allows_reuse && !wants_close(resp.headers()), Ordering::SeqCst);
    }
    // The connection winds down once the response body is done.
    drop(sender);

    if let Some(inbound) = inbound_upgrade {
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let outbound = hyper::upgrade::on(&mut resp);
            let client_id = session.id().to_string();
            tokio::spawn(async move {
                match tokio::try_join!(inbound, outbound) {
                    Ok((public, tunnel)) => {
                        splice(&client_id, TokioIo::new(public), TokioIo::new(tunnel)).await;
                    }
                    Err(e) => debug!(client_id = %client_id, "upgrade failed: {}", e),
                }
            });
        }
    }

    Ok(resp.map(Body::new))
}

/// Relays an upgrade request that opened a public connection.
///
/// The request line and headers are rebuilt byte for byte from `head` and
/// written onto the pooled socket, followed by any bytes that arrived after
/// the head or while waiting for a link, and then the two sockets are
/// spliced.
pub async fn forward_raw_upgrade(
    session: Arc<ClientSession>,
    head: RequestHead,
    mut public: TcpStream,
    leftover: Bytes,
) {
    debug!(client_id = %session.id(), "> [up] {}", head.path);

    // Bytes the public client sends while no link is free are held, so its
    // hang-up is still noticed.
    let mut early = BytesMut::from(&leftover[..]);
    let acquired = {
        let acquire = session.pool().acquire();
        tokio::pin!(acquire);
        loop {
            let room = early.len() < RELAY_BUFFER_SIZE;
            tokio::select! {
                res = &mut acquire => break res,
                read = public.read_buf(&mut early), if room => match read {
                    Ok(0) | Err(_) => {
                        debug!(client_id = %session.id(), "public socket closed while waiting for a tunnel");
                        return;
                    }
                    Ok(_) => {}
                },
            }
        }
    };
    debug!(client_id = %session.id(), "< [up] {}", head.path);

    let mut tunnel: PooledSocket = match acquired {
        Ok(socket) => socket,
        Err(e) => {
            debug!(client_id = %session.id(), "no tunnel for upgrade: {}", e);
            let _ = public.shutdown().await;
            return;
        }
    };

    let mut preamble = serialize_upgrade_head(&head);
    preamble.extend_from_slice(&early);
    if let Err(e) = tunnel.write_all(&preamble).await {
        if is_peer_churn(&e) {
            debug!(client_id = %session.id(), "tunnel closed before upgrade: {}", e);
        } else {
            error!(client_id = %session.id(), "failed to write upgrade head: {}", e);
        }
        let _ = public.shutdown().await;
        return;
    }

    splice(session.id(), public, tunnel).await;
}

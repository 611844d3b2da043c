//! Registering with the relay's management API.

use reqwest::Client;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::client::config::TunnelOptions;
use crate::client::errors::{TunnelError, TunnelResult};
use crate::common::types::NewClientResponse;

/// Routing info handed out by the relay for one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub client_id: String,
    pub url: String,
    pub max_conn_count: usize,
    pub remote_host: String,
    /// Overrides `remote_host` for link dials when the relay reports one.
    pub remote_ip: Option<String>,
    pub remote_port: u16,
    pub local_host: Option<String>,
    pub local_port: u16,
}

impl TunnelInfo {
    pub fn from_response(body: NewClientResponse, options: &TunnelOptions) -> TunnelResult<Self> {
        let url = body
            .url
            .ok_or_else(|| TunnelError::InvalidResponse("server did not return a tunnel URL".into()))?;
        let remote_host = parse_server_url(&options.host)?
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| TunnelError::Config(format!("no host in server URL '{}'", options.host)))?;

        Ok(Self {
            client_id: body.id,
            url,
            max_conn_count: body.max_conn_count.unwrap_or(1).max(1),
            remote_host,
            remote_ip: body.ip,
            remote_port: body.port,
            local_host: options.local_host.clone(),
            local_port: options.local_port,
        })
    }

    /// `host:port` the links dial.
    pub fn remote_addr(&self) -> String {
        let host = self.remote_ip.as_deref().unwrap_or(&self.remote_host);
        if host.contains(':') {
            format!("[{}]:{}", host, self.remote_port)
        } else {
            format!("{}:{}", host, self.remote_port)
        }
    }
}

fn parse_server_url(host: &str) -> TunnelResult<Url> {
    Url::parse(host).map_err(|e| TunnelError::Config(format!("invalid server URL '{}': {}", host, e)))
}

/// `POST` target for registering, with the requested subdomain if any.
pub fn registration_url(options: &TunnelOptions) -> TunnelResult<Url> {
    let base = options.host.trim_end_matches('/');
    let raw = match &options.subdomain {
        Some(subdomain) => format!("{}/api/tunnels/{}", base, subdomain),
        None => format!("{}/api/tunnels", base),
    };
    parse_server_url(&raw)
}

/// Registers a tunnel, retrying transient failures per `options.retry`.
///
/// A 4xx answer is final and carries the server's message.
pub async fn register(client: &Client, options: &TunnelOptions) -> TunnelResult<TunnelInfo> {
    let url = registration_url(options)?;
    let mut failures = 0u32;

    loop {
        match request_info(client, &url, options).await {
            Ok(info) => return Ok(info),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                failures += 1;
                if !options.retry.allows(failures) {
                    return Err(TunnelError::RetriesExhausted {
                        attempts: failures,
                        last: Box::new(e),
                    });
                }
                warn!("retrying connection to the server (attempt {}): {}", failures, e);
                sleep(options.retry.delay).await;
            }
        }
    }
}

async fn request_info(client: &Client, url: &Url, options: &TunnelOptions) -> TunnelResult<TunnelInfo> {
    debug!("retrieving tunnel information from {}", url);
    let resp = client.post(url.clone()).send().await?;

    let status = resp.status();
    if status.is_client_error() {
        let text = resp.text().await.unwrap_or_default();
        let message = if text.trim().is_empty() {
            status.to_string()
        } else {
            text
        };
        return Err(TunnelError::BadRequest(message));
    }

    let body: NewClientResponse = resp
        .error_for_status()?
        .json()
        .await
        .map_err(|e| TunnelError::InvalidResponse(e.to_string()))?;
    let info = TunnelInfo::from_response(body, options)?;
    debug!("got tunnel information: {:?}", info);
    Ok(info)
}

//! A self-healing set of links between the relay and the local target.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::client::config::RetryPolicy;
use crate::client::errors::TunnelError;
use crate::client::host_rewrite::HostRewriter;
use crate::client::local::{LocalStream, LocalTarget};
use crate::client::registration::TunnelInfo;
use crate::common::errors::is_connection_refused;
use crate::common::http_conn::{sniff_request_line, RequestLine};
use crate::common::relay::{log_io_error, log_transfer_summary, pump, RELAY_BUFFER_SIZE};

/// Something that happened to one link.
#[derive(Debug)]
pub enum ClusterEvent {
    /// The link reached the relay.
    Open { link_id: String },
    /// The link is gone. `connected` is false when the relay was never
    /// reached; `local_failed` is set when the local target could not be
    /// dialed.
    Dead {
        link_id: String,
        connected: bool,
        local_failed: bool,
    },
    Error(TunnelError),
    /// A request line seen on a link, for display only.
    Request(RequestLine),
}

struct ClusterInner {
    info: Arc<TunnelInfo>,
    local: LocalTarget,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<ClusterEvent>,
    closed: watch::Receiver<bool>,
}

impl ClusterInner {
    fn emit(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }
}

/// Opens links on request. Every link reports exactly one `Dead` event,
/// whether or not it ever connected; keeping the link count up is left to
/// whoever consumes the events.
#[derive(Clone)]
pub struct LinkCluster {
    inner: Arc<ClusterInner>,
}

impl LinkCluster {
    /// `closed` flipping to `true`, or its sender going away, tears down
    /// every link as soon as it is connected.
    pub fn new(
        info: Arc<TunnelInfo>,
        local: LocalTarget,
        retry: RetryPolicy,
        closed: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let cluster = Self {
            inner: Arc::new(ClusterInner {
                info,
                local,
                retry,
                events,
                closed,
            }),
        };
        (cluster, rx)
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.inner.info
    }

    /// Starts one link and returns its id.
    pub fn open(&self) -> String {
        self.open_after(None)
    }

    /// Starts one link after `delay`.
    pub fn open_after(&self, delay: Option<Duration>) -> String {
        let link_id = random_link_id();
        let inner = self.inner.clone();
        let id = link_id.clone();
        tokio::spawn(async move {
            run_link(inner, id, delay).await;
        });
        link_id
    }
}

/// Whether the owner asked for close or went away.
pub(crate) fn is_closing(closed: &watch::Receiver<bool>) -> bool {
    closed.has_changed().is_err() || *closed.borrow()
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

fn random_link_id() -> String {
    format!("{:06x}", rand::thread_rng().gen_range(0..0x100_0000u32))
}

async fn run_link(inner: Arc<ClusterInner>, link_id: String, delay: Option<Duration>) {
    let mut closed = inner.closed.clone();

    if let Some(delay) = delay {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = closed_signal(&mut closed) => {}
        }
    }
    if is_closing(&closed) {
        inner.emit(ClusterEvent::Dead {
            link_id,
            connected: false,
            local_failed: false,
        });
        return;
    }

    let remote_addr = inner.info.remote_addr();
    debug!(
        link_id = %link_id,
        "establishing tunnel {}://{}:{} <> {}",
        inner.local.scheme(),
        inner.local.host(),
        inner.local.port(),
        remote_addr
    );

    let remote = match connect_remote(&remote_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            error!(link_id = %link_id, "got remote connection error {}", e);
            if is_connection_refused(&e) {
                inner.emit(ClusterEvent::Error(TunnelError::RemoteRefused {
                    link_id: link_id.clone(),
                    addr: remote_addr,
                }));
            }
            inner.emit(ClusterEvent::Dead {
                link_id,
                connected: false,
                local_failed: false,
            });
            return;
        }
    };

    inner.emit(ClusterEvent::Open { link_id: link_id.clone() });

    let local_failed = if is_closing(&closed) {
        debug!(link_id = %link_id, "cluster closed, dropping new link");
        false
    } else {
        serve_link(&inner, &link_id, remote, &mut closed).await
    };

    inner.emit(ClusterEvent::Dead {
        link_id,
        connected: true,
        local_failed,
    });
}

async fn connect_remote(addr: &str) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on link: {}", e);
    }
    let socket_ref = socket2::SockRef::from(&stream);
    if let Err(e) = socket_ref.set_keepalive(true) {
        debug!("Failed to set SO_KEEPALIVE on link: {}", e);
    }
    Ok(stream)
}

/// Pairs the link with a local connection and relays until either side is
/// done. Returns whether the local target could not be dialed.
async fn serve_link(inner: &ClusterInner, link_id: &str, remote: TcpStream, closed: &mut watch::Receiver<bool>) -> bool {
    let local = match dial_local(inner, link_id, &remote, closed).await {
        Ok(local) => local,
        Err(LocalDialEnd::Failed) => return true,
        Err(LocalDialEnd::Abandoned) => return false,
    };
    debug!(link_id, "connected locally");

    let rewriter = inner.info.local_host.as_deref().map(|host| {
        debug!(link_id, "transform Host header to {}", host);
        HostRewriter::new(host)
    });

    let (remote_read, remote_write) = remote.into_split();
    let (local_read, local_write) = tokio::io::split(local);
    let outbound_label = format!("{link_id} <-");

    let relay = async {
        let inbound = relay_inbound(link_id, remote_read, local_write, rewriter, &inner.events);
        let outbound = pump(&outbound_label, local_read, remote_write);
        tokio::pin!(inbound, outbound);
        tokio::select! {
            // The relay closing the link ends it, whatever the local side is doing.
            down = &mut inbound => {
                debug!(link_id, "remote close");
                (down, None)
            }
            up = &mut outbound => {
                debug!(link_id, "local connection closed");
                (inbound.await, Some(up))
            }
        }
    };

    tokio::select! {
        (down, up) = relay => {
            log_transfer_summary(link_id, "->", down);
            if let Some(up) = up {
                log_transfer_summary(link_id, "<-", up);
            }
        }
        _ = closed_signal(closed) => {
            debug!(link_id, "cluster closed, destroying link");
        }
    }
    false
}

/// Why a link gave up on its local half.
enum LocalDialEnd {
    /// The local target kept refusing or failed outright.
    Failed,
    /// The relay side went away or the cluster closed first.
    Abandoned,
}

/// Dials the local target while the link waits unread.
///
/// A refused connect is retried on the same link per the retry policy; any
/// other failure, or the link closing meanwhile, gives up.
async fn dial_local(
    inner: &ClusterInner,
    link_id: &str,
    remote: &TcpStream,
    closed: &mut watch::Receiver<bool>,
) -> Result<LocalStream, LocalDialEnd> {
    let mut failures = 0u32;
    loop {
        debug!(
            link_id,
            "connecting locally to {}://{}:{}",
            inner.local.scheme(),
            inner.local.host(),
            inner.local.port()
        );

        let attempt = tokio::select! {
            res = inner.local.connect() => res,
            _ = remote_gone(remote) => {
                debug!(link_id, "remote destroyed");
                return Err(LocalDialEnd::Abandoned);
            }
            _ = closed_signal(closed) => return Err(LocalDialEnd::Abandoned),
        };

        match attempt {
            Ok(local) => return Ok(local),
            Err(e) if is_connection_refused(&e) => {
                failures += 1;
                if !inner.retry.allows(failures) {
                    warn!(link_id, "local target refused {} connections, giving up", failures);
                    return Err(LocalDialEnd::Failed);
                }
                debug!(link_id, "local error {}, retrying in {:?}", e, inner.retry.delay);
                tokio::select! {
                    _ = sleep(inner.retry.delay) => {}
                    _ = remote_gone(remote) => {
                        debug!(link_id, "remote destroyed");
                        return Err(LocalDialEnd::Abandoned);
                    }
                    _ = closed_signal(closed) => return Err(LocalDialEnd::Abandoned),
                }
            }
            Err(e) => {
                warn!(link_id, "local error {}", e);
                return Err(LocalDialEnd::Failed);
            }
        }
    }
}

/// Resolves once the relay side of an unread link hits EOF or fails.
async fn remote_gone(remote: &TcpStream) {
    let mut probe = [0u8; 1];
    match remote.peek(&mut probe).await {
        Ok(0) | Err(_) => {}
        // Data is waiting; the link is alive until it gets read.
        Ok(_) => std::future::pending().await,
    }
}

/// Relay -> local direction: sniffs request lines and rewrites `Host`.
async fn relay_inbound<R, W>(
    link_id: &str,
    mut reader: R,
    mut writer: W,
    mut rewriter: Option<HostRewriter>,
    events: &mpsc::UnboundedSender<ClusterEvent>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let direction = format!("{link_id} ->");
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total_bytes: u64 = 0;

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_io_error(&direction, "read", &e);
                break;
            }
        };
        let chunk = &buffer[..n];
        if let Some(line) = sniff_request_line(chunk) {
            let _ = events.send(ClusterEvent::Request(line));
        }

        let rewritten: Bytes;
        let out = match rewriter.as_mut() {
            Some(rewriter) => {
                rewritten = rewriter.push(chunk);
                &rewritten[..]
            }
            None => chunk,
        };
        if let Err(e) = writer.write_all(out).await {
            log_io_error(&direction, "write", &e);
            return total_bytes;
        }
        if let Err(e) = writer.flush().await {
            log_io_error(&direction, "flush", &e);
            return total_bytes;
        }
        total_bytes += n as u64;
    }

    if let Some(rest) = rewriter.as_mut().map(HostRewriter::finish) {
        if !rest.is_empty() {
            if let Err(e) = writer.write_all(&rest).await {
                log_io_error(&direction, "write", &e);
            }
        }
    }
    let _ = writer.shutdown().await;
    total_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_ids_are_six_hex_digits() {
        for _ in 0..100 {
            let id = random_link_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn dropped_owner_counts_as_closing() {
        let (tx, rx) = watch::channel(false);
        assert!(!is_closing(&rx));
        drop(tx);
        assert!(is_closing(&rx));
    }

    #[tokio::test]
    async fn inbound_relay_sniffs_and_rewrites() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let request: &[u8] = b"GET /hello HTTP/1.1\r\nHost: abc123.example.com\r\n\r\n";
        let mut out = Vec::new();

        let n = relay_inbound(
            "test",
            request,
            &mut out,
            Some(HostRewriter::new("localhost")),
            &events_tx,
        )
        .await;

        assert_eq!(n, request.len() as u64);
        assert_eq!(out, b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");
        match events_rx.try_recv() {
            Ok(ClusterEvent::Request(line)) => {
                assert_eq!(line.method, "GET");
                assert_eq!(line.path, "/hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

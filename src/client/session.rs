use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use crate::client::cluster::{is_closing, ClusterEvent, LinkCluster};
use crate::client::config::{RetryPolicy, TunnelOptions};
use crate::client::errors::{TunnelError, TunnelResult};
use crate::client::local::LocalTarget;
use crate::client::registration::{register, TunnelInfo};
use crate::common::http_conn::RequestLine;

const ERROR_CAPACITY: usize = 64;
const REQUEST_CAPACITY: usize = 256;

/// A registered tunnel and the links that serve it.
///
/// Dropping the session closes it.
pub struct TunnelSession {
    info: Arc<TunnelInfo>,
    close: watch::Sender<bool>,
    errors: broadcast::Sender<Arc<TunnelError>>,
    requests: broadcast::Sender<RequestLine>,
    tunnel_count: Arc<AtomicUsize>,
}

impl TunnelSession {
    /// Registers with the relay and waits for the first link to connect.
    pub async fn open(options: TunnelOptions) -> TunnelResult<Self> {
        let client = Client::builder().build()?;
        let info = register(&client, &options).await?;
        let local = LocalTarget::new(info.local_host.as_deref(), info.local_port, options.local_tls.as_ref())?;
        Self::establish(info, local, options.retry).await
    }

    /// Opens `max_conn_count` links for already obtained routing info.
    ///
    /// Resolves once one link is connected; the rest come up on their own.
    pub async fn establish(info: TunnelInfo, local: LocalTarget, retry: RetryPolicy) -> TunnelResult<Self> {
        let info = Arc::new(info);
        let (close, closed) = watch::channel(false);
        let (cluster, events) = LinkCluster::new(info.clone(), local, retry, closed.clone());
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        let (requests, _) = broadcast::channel(REQUEST_CAPACITY);
        let tunnel_count = Arc::new(AtomicUsize::new(0));
        let (ready_tx, ready_rx) = oneshot::channel();

        let links = info.max_conn_count.max(1);
        let driver = Driver {
            cluster: cluster.clone(),
            closed,
            retry,
            errors: errors.clone(),
            requests: requests.clone(),
            tunnel_count: tunnel_count.clone(),
            ready: Some(ready_tx),
            in_flight: links,
        };
        tokio::spawn(driver.run(events));

        for _ in 0..links {
            cluster.open();
        }

        let session = Self {
            info,
            close,
            errors,
            requests,
            tunnel_count,
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => {
                session.close();
                Err(e)
            }
            Err(_) => Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel closed before any link connected",
            ))),
        }
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    /// Links currently connected to the relay.
    pub fn tunnel_count(&self) -> usize {
        self.tunnel_count.load(Ordering::SeqCst)
    }

    /// Link-level errors, such as the relay refusing connections.
    pub fn errors(&self) -> broadcast::Receiver<Arc<TunnelError>> {
        self.errors.subscribe()
    }

    /// Request lines seen on the links.
    pub fn requests(&self) -> broadcast::Receiver<RequestLine> {
        self.requests.subscribe()
    }

    /// Stops replacing links and tears down every link once it is connected.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the link count. All cluster events are handled here, one at a time.
struct Driver {
    cluster: LinkCluster,
    closed: watch::Receiver<bool>,
    retry: RetryPolicy,
    errors: broadcast::Sender<Arc<TunnelError>>,
    requests: broadcast::Sender<RequestLine>,
    tunnel_count: Arc<AtomicUsize>,
    ready: Option<oneshot::Sender<TunnelResult<()>>>,
    /// Links started that have not reported `Dead` yet.
    in_flight: usize,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        let mut dial_failures = 0u32;
        let mut gave_up = false;

        while let Some(event) = events.recv().await {
            match event {
                ClusterEvent::Open { link_id } => {
                    dial_failures = 0;
                    let total = self.tunnel_count.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(link_id = %link_id, "tunnel open [total: {}]", total);
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
                ClusterEvent::Dead {
                    link_id,
                    connected,
                    local_failed,
                } => {
                    self.in_flight -= 1;
                    if connected {
                        let total = self.tunnel_count.fetch_sub(1, Ordering::SeqCst) - 1;
                        debug!(link_id = %link_id, "tunnel dead [total: {}]", total);
                    } else {
                        dial_failures += 1;
                    }

                    if !gave_up && self.ready.is_some() && !self.retry.allows(dial_failures) {
                        gave_up = true;
                        if let Some(ready) = self.ready.take() {
                            let _ = ready.send(Err(TunnelError::RetriesExhausted {
                                attempts: dial_failures,
                                last: Box::new(TunnelError::Io(io::Error::new(
                                    io::ErrorKind::NotConnected,
                                    format!("could not reach {}", self.cluster.info().remote_addr()),
                                ))),
                            }));
                        }
                    }

                    if gave_up || is_closing(&self.closed) {
                        if self.in_flight == 0 {
                            break;
                        }
                        continue;
                    }

                    // Neither an unreachable relay nor a failing local target
                    // is hammered.
                    let delay = (!connected || local_failed).then_some(self.retry.delay);
                    self.cluster.open_after(delay);
                    self.in_flight += 1;
                }
                ClusterEvent::Error(e) => {
                    debug!("got socket error: {}", e);
                    let _ = self.errors.send(Arc::new(e));
                }
                ClusterEvent::Request(line) => {
                    let _ = self.requests.send(line);
                }
            }
        }
        debug!("tunnel {} closed", self.cluster.info().client_id);
    }
}

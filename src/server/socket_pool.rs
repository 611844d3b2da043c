//! Pool of client-originated TCP links for one tunnel session.
//!
//! A tunnel client opens up to `max_sockets` TCP connections to the port this
//! pool listens on. Each of those connections later carries one forwarded
//! request at a time. Idle sockets wait in `available`; requests that arrive
//! while no socket is idle wait in `waiting`. The two queues are never both
//! non-empty: an arriving socket always goes to the oldest waiter first.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::common::errors::is_peer_churn;

pub const DEFAULT_MAX_SOCKETS: usize = 10;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("closed")]
    Closed,

    #[error("already started")]
    AlreadyStarted,

    #[error("failed to bind tunnel listener: {0}")]
    Bind(#[source] io::Error),
}

/// Which client a pool transition is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<IpAddr>,
}

/// Observable pool transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Connected sockets went from 0 to 1.
    Online(ClientInfo),
    /// Connected sockets dropped back to 0.
    Offline(ClientInfo),
    /// The pool was closed; no further events follow.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub connected_sockets: usize,
    pub available_sockets: usize,
    pub waiting_requests: usize,
}

type Waiter = oneshot::Sender<PooledSocket>;

/// An idle socket's mailbox. Sending a waiter hands the socket over.
struct IdleSocket {
    id: u64,
    claim: oneshot::Sender<Waiter>,
}

struct PoolState {
    started: bool,
    closed: bool,
    connected_sockets: usize,
    available: VecDeque<IdleSocket>,
    waiting: VecDeque<Waiter>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct PoolShared {
    client_id: String,
    max_sockets: usize,
    bind_addr: IpAddr,
    next_socket_id: AtomicU64,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
}

/// Cloneable handle to one session's socket pool.
#[derive(Clone)]
pub struct SocketPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPool")
            .field("client_id", &self.shared.client_id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SocketPool {
    pub fn new(client_id: impl Into<String>, max_sockets: usize, bind_addr: IpAddr) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(PoolShared {
                client_id: client_id.into(),
                max_sockets: max_sockets.max(1),
                bind_addr,
                next_socket_id: AtomicU64::new(1),
                state: Mutex::new(PoolState {
                    started: false,
                    closed: false,
                    connected_sockets: 0,
                    available: VecDeque::new(),
                    waiting: VecDeque::new(),
                    shutdown: None,
                }),
                events,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn max_sockets(&self) -> usize {
        self.shared.max_sockets
    }

    /// Subscribe to online/offline/end transitions. Only events emitted after
    /// the call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Binds an ephemeral listener for the client's links and starts
    /// accepting. Returns the bound port.
    pub async fn listen(&self) -> Result<u16, PoolError> {
        {
            let mut state = self.shared.lock();
            if state.started {
                return Err(PoolError::AlreadyStarted);
            }
            state.started = true;
        }

        let listener = TcpListener::bind((self.shared.bind_addr, 0))
            .await
            .map_err(PoolError::Bind)?;
        let port = listener.local_addr().map_err(PoolError::Bind)?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.shutdown = Some(shutdown_tx);
        }

        info!(client_id = %self.shared.client_id, "tcp server listening on port: {}", port);
        tokio::spawn(accept_loop(self.clone(), listener, shutdown_rx));

        Ok(port)
    }

    /// Takes an idle socket, waiting for one to connect if none is idle.
    ///
    /// Fails with [`PoolError::Closed`] once the pool is closed, including for
    /// callers that were already waiting.
    pub async fn acquire(&self) -> Result<PooledSocket, PoolError> {
        let rx = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }

            let (tx, rx) = oneshot::channel();
            self.assign_waiter(&mut state, tx, false);
            rx
        };

        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Hands `waiter` to the first idle socket still alive, or queues it.
    fn assign_waiter(&self, state: &mut PoolState, waiter: Waiter, front: bool) {
        let mut waiter = waiter;
        while let Some(idle) = state.available.pop_front() {
            match idle.claim.send(waiter) {
                Ok(()) => {
                    debug!(client_id = %self.shared.client_id, socket = idle.id, "socket given");
                    return;
                }
                // The idle socket closed under us; its lease settles the count.
                Err(returned) => waiter = returned,
            }
        }
        // Acquirers that gave up leave their sender behind.
        state.waiting.retain(|w| !w.is_closed());
        if front {
            state.waiting.push_front(waiter);
        } else {
            state.waiting.push_back(waiter);
        }
        debug!(client_id = %self.shared.client_id, stats = ?state.stats(), "no available sockets");
    }

    /// Puts back a waiter whose socket died while being handed over.
    fn requeue(&self, waiter: Waiter) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        self.assign_waiter(&mut state, waiter, true);
    }

    /// Gives a socket back after a completed exchange so it can serve the
    /// next request.
    pub fn release(&self, socket: PooledSocket) {
        if !Arc::ptr_eq(&socket.lease.pool, &self.shared) {
            return;
        }
        debug!(client_id = %self.shared.client_id, socket = socket.lease.id, "socket returned");
        self.park(socket);
    }

    /// Closes the pool: waiting acquirers fail, idle sockets and the listener
    /// are dropped. Sockets currently lent out finish their exchange.
    pub fn close(&self) {
        let (waiting, available, shutdown) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.waiting),
                std::mem::take(&mut state.available),
                state.shutdown.take(),
            )
        };

        debug!(client_id = %self.shared.client_id, waiting = waiting.len(), "closed tcp socket");
        // Dropping the senders fails each waiter with `Closed`.
        drop(waiting);
        drop(available);
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        let _ = self.shared.events.send(PoolEvent::End);
    }

    fn on_socket_connected(&self, stream: TcpStream, peer: SocketAddr) {
        let client = ClientInfo { ip: Some(peer.ip()) };

        let socket = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            if state.connected_sockets >= self.shared.max_sockets {
                debug!(
                    client_id = %self.shared.client_id,
                    %peer,
                    stats = ?state.stats(),
                    "no more sockets allowed"
                );
                return;
            }

            state.connected_sockets += 1;
            if state.connected_sockets == 1 {
                let _ = self.shared.events.send(PoolEvent::Online(client.clone()));
            }
            debug!(client_id = %self.shared.client_id, %peer, stats = ?state.stats(), "socket opened");

            PooledSocket {
                stream,
                peer,
                lease: SocketLease {
                    id: self.shared.next_socket_id.fetch_add(1, Ordering::Relaxed),
                    peer,
                    pool: self.shared.clone(),
                },
            }
        };

        self.park(socket);
    }

    /// Hands `socket` to the oldest live waiter, or queues it as available.
    fn park(&self, socket: PooledSocket) {
        // Declared before the guard so an early return releases the lock
        // before the socket's lease runs.
        let mut socket = socket;
        let mut state = self.shared.lock();
        if state.closed {
            drop(state);
            return;
        }

        while let Some(waiter) = state.waiting.pop_front() {
            match waiter.send(socket) {
                Ok(()) => {
                    debug!(client_id = %self.shared.client_id, stats = ?state.stats(), "socket given to queued connection");
                    return;
                }
                // That acquirer gave up; try the next one.
                Err(returned) => socket = returned,
            }
        }

        let (claim_tx, claim_rx) = oneshot::channel();
        state.available.push_back(IdleSocket {
            id: socket.lease.id,
            claim: claim_tx,
        });
        debug!(client_id = %self.shared.client_id, stats = ?state.stats(), "socket waiting for new connection");
        drop(state);

        tokio::spawn(hold_idle(self.clone(), socket, claim_rx));
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_socket_closed(&self, id: u64, peer: SocketAddr) {
        let mut state = self.lock();
        state.connected_sockets = state.connected_sockets.saturating_sub(1);
        state.available.retain(|idle| idle.id != id);
        debug!(client_id = %self.client_id, %peer, stats = ?state.stats(), "socket closed");

        if state.connected_sockets == 0 {
            debug!(client_id = %self.client_id, "all sockets disconnected");
            let _ = self.events.send(PoolEvent::Offline(ClientInfo {
                ip: Some(peer.ip()),
            }));
        }
    }
}

impl PoolState {
    fn stats(&self) -> PoolStats {
        PoolStats {
            connected_sockets: self.connected_sockets,
            available_sockets: self.available.len(),
            waiting_requests: self.waiting.iter().filter(|w| !w.is_closed()).count(),
        }
    }
}

async fn accept_loop(pool: SocketPool, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let socket_ref = socket2::SockRef::from(&stream);
                    if let Err(e) = socket_ref.set_keepalive(true) {
                        debug!("Failed to set SO_KEEPALIVE on tunnel socket: {}", e);
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on tunnel socket: {}", e);
                    }
                    pool.on_socket_connected(stream, peer);
                }
                Err(e) if is_peer_churn(&e) => {
                    debug!(client_id = %pool.client_id(), "accept interrupted: {}", e);
                }
                Err(e) => {
                    error!(client_id = %pool.client_id(), "tunnel listener error: {}", e);
                }
            }
        }
    }
    debug!(client_id = %pool.client_id(), "tunnel listener closed");
}

/// Owns an idle socket until it is claimed or the peer goes away.
///
/// Anything the peer sends while idle is drained so it never stalls on a
/// full window.
async fn hold_idle(pool: SocketPool, socket: PooledSocket, mut claim: oneshot::Receiver<Waiter>) {
    match watch_idle(&pool, &socket, &mut claim).await {
        Some(Ok(waiter)) => {
            if let Err(socket) = waiter.send(socket) {
                pool.park(socket);
            }
        }
        // Pool closed or dropped this entry.
        Some(Err(_)) => {}
        None => {
            // A waiter may have claimed the socket as it died.
            drop(socket);
            if let Ok(waiter) = claim.try_recv() {
                pool.requeue(waiter);
            }
        }
    }
}

/// Resolves with the claim, or `None` once the socket died.
async fn watch_idle(
    pool: &SocketPool,
    socket: &PooledSocket,
    claim: &mut oneshot::Receiver<Waiter>,
) -> Option<Result<Waiter, oneshot::error::RecvError>> {
    let mut scratch = [0u8; 1024];
    loop {
        tokio::select! {
            biased;
            claimed = &mut *claim => return Some(claimed),
            ready = socket.stream.readable() => {
                if let Err(e) = ready {
                    debug!(client_id = %pool.client_id(), "idle socket error: {}", e);
                    return None;
                }
                match socket.stream.try_read(&mut scratch) {
                    Ok(0) => return None,
                    Ok(n) => debug!(client_id = %pool.client_id(), "discarded {} idle bytes", n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(client_id = %pool.client_id(), "socket error: {}", e);
                        return None;
                    }
                }
            }
        }
    }
}

/// Decrements the pool's connected count when the socket it guards is gone.
struct SocketLease {
    id: u64,
    peer: SocketAddr,
    pool: Arc<PoolShared>,
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.pool.on_socket_closed(self.id, self.peer);
    }
}

/// A client link lent out of a [`SocketPool`].
///
/// Dropping it closes the link and frees its slot in the pool; hand it to
/// [`SocketPool::release`] instead to keep the link for the next request.
pub struct PooledSocket {
    stream: TcpStream,
    peer: SocketAddr,
    lease: SocketLease,
}

impl PooledSocket {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn id(&self) -> u64 {
        self.lease.id
    }
}

impl std::fmt::Debug for PooledSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSocket")
            .field("id", &self.lease.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl AsyncRead for PooledSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

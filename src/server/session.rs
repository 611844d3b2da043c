use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::server::socket_pool::{PoolEvent, PoolStats, SocketPool};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// How a session's watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// No link was connected for a whole grace window.
    GraceExpired,
    /// The pool was closed by someone else.
    Closed,
}

/// Server-side state for one public subdomain.
#[derive(Debug)]
pub struct ClientSession {
    id: String,
    pool: SocketPool,
}

impl ClientSession {
    pub fn new(id: impl Into<String>, pool: SocketPool) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            pool,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &SocketPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Runs the session's grace timer until the session should go away.
    ///
    /// The timer is armed right away, so a client that never connects a link
    /// is dropped too. It is disarmed on every online event and re-armed on
    /// every offline event; all of that happens on this one task.
    pub async fn watch(&self, mut events: broadcast::Receiver<PoolEvent>, grace: Duration) -> SessionEnd {
        let mut deadline = if self.pool.stats().connected_sockets == 0 {
            Some(Instant::now() + grace)
        } else {
            None
        };

        loop {
            let armed = deadline;
            let expiry = async move {
                match armed {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Ok(PoolEvent::Online(client)) => {
                        debug!(client_id = %self.id, ip = ?client.ip, "client online");
                        deadline = None;
                    }
                    Ok(PoolEvent::Offline(client)) => {
                        debug!(client_id = %self.id, ip = ?client.ip, "client offline");
                        deadline = Some(Instant::now() + grace);
                    }
                    Ok(PoolEvent::End) | Err(RecvError::Closed) => {
                        self.pool.close();
                        return SessionEnd::Closed;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(client_id = %self.id, skipped, "session events lagged");
                        deadline = match (self.pool.stats().connected_sockets, deadline) {
                            (0, None) => Some(Instant::now() + grace),
                            (0, armed) => armed,
                            _ => None,
                        };
                    }
                },
                _ = expiry => {
                    info!(client_id = %self.id, "client did not reconnect within {:?}", grace);
                    self.pool.close();
                    return SessionEnd::GraceExpired;
                }
            }
        }
    }
}

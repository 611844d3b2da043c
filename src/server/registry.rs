use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::common::types::NewClientResult;
use crate::server::metrics::record;
use crate::server::session::{ClientSession, SessionEnd, DEFAULT_GRACE_PERIOD};
use crate::server::socket_pool::{PoolError, SocketPool, DEFAULT_MAX_SOCKETS};
use crate::server::utils::human_readable_id;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Links each client may hold open at once.
    pub max_sockets: usize,
    /// How long a session may sit with no links before it is removed.
    pub grace_period: Duration,
    /// Address the per-session link listeners bind to.
    pub bind_addr: IpAddr,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            grace_period: DEFAULT_GRACE_PERIOD,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

struct RegistryInner {
    options: RegistryOptions,
    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    tunnels: AtomicUsize,
}

/// Maps public subdomains to their sessions. Memory only; each server
/// process owns its own registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                options,
                sessions: Mutex::new(HashMap::new()),
                tunnels: AtomicUsize::new(0),
            }),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Creates a session, under `requested` when that id is free and under a
    /// generated id otherwise. Callers must use the id in the result.
    pub async fn create_session(&self, requested: Option<&str>) -> Result<NewClientResult, RegistryError> {
        let (session, events, custom) = {
            let mut sessions = self.lock();
            let custom = requested.is_some_and(|wanted| !sessions.contains_key(wanted));
            let id = match requested {
                Some(wanted) if custom => {
                    debug!("making new client with custom id {}", wanted);
                    wanted.to_string()
                }
                Some(wanted) => {
                    let id = unused_id(&sessions);
                    debug!(
                        "making new client with generated id {} - requested client id {} was already in use",
                        id, wanted
                    );
                    id
                }
                None => {
                    let id = unused_id(&sessions);
                    debug!("making new client with generated id {}", id);
                    id
                }
            };

            let pool = SocketPool::new(&id, self.inner.options.max_sockets, self.inner.options.bind_addr);
            let events = pool.subscribe();
            let session = ClientSession::new(id.clone(), pool);

            // Reserve the id before binding so a concurrent request for the
            // same id sees it as taken.
            sessions.insert(id, session.clone());
            self.inner.tunnels.fetch_add(1, Ordering::SeqCst);
            record::client_connected();
            (session, events, custom)
        };

        let port = match session.pool().listen().await {
            Ok(port) => port,
            Err(e) => {
                self.remove_if_current(&session);
                return Err(e.into());
            }
        };
        record::tunnel_created();
        if custom {
            record::custom_subdomain_granted();
        }

        let registry = self.clone();
        let watched = session.clone();
        let grace = self.inner.options.grace_period;
        tokio::spawn(async move {
            if watched.watch(events, grace).await == SessionEnd::GraceExpired {
                info!(client_id = %watched.id(), "removing client after grace period");
            }
            registry.remove_if_current(&watched);
        });

        Ok(NewClientResult {
            id: session.id().to_string(),
            port,
            max_conn_count: self.inner.options.max_sockets,
        })
    }

    /// Removes and closes the session registered under `id`, if any.
    pub fn remove_session(&self, id: &str) {
        let removed = self.lock().remove(id);
        if let Some(session) = removed {
            self.on_removed(&session);
        }
    }

    /// Removes `session` only while it is still the one registered under its
    /// id, so a late timer never evicts a newer session reusing the id.
    fn remove_if_current(&self, session: &Arc<ClientSession>) {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(session.id()),
                _ => None,
            }
        };
        if let Some(session) = removed {
            self.on_removed(&session);
        }
    }

    fn on_removed(&self, session: &ClientSession) {
        debug!("removing client: {}", session.id());
        self.inner.tunnels.fetch_sub(1, Ordering::SeqCst);
        record::client_removed();
        session.close();
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of registered sessions.
    pub fn tunnel_count(&self) -> usize {
        self.inner.tunnels.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ClientSession>>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unused_id(sessions: &HashMap<String, Arc<ClientSession>>) -> String {
    loop {
        let id = human_readable_id();
        if !sessions.contains_key(&id) {
            return id;
        }
    }
}

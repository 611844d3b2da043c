pub mod app;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod socket_pool;
pub mod utils;

pub use app::{AppState, TunnelServer};
pub use config::{Args, ServerOptions};
pub use handlers::HostRouter;
pub use proxy::{forward_raw_upgrade, forward_request, ForwardError};
pub use registry::{RegistryError, RegistryOptions, SessionRegistry};
pub use session::{ClientSession, SessionEnd, DEFAULT_GRACE_PERIOD};
pub use socket_pool::{
    ClientInfo, PoolError, PoolEvent, PoolStats, PooledSocket, SocketPool, DEFAULT_MAX_SOCKETS,
};

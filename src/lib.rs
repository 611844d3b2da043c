pub mod client;
pub mod common;
pub mod server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use client::{TunnelError, TunnelOptions, TunnelResult, TunnelSession};
pub use common::{NewClientResponse, NewClientResult, TunnelStatus};
pub use server::{ServerOptions, SessionRegistry, SocketPool, TunnelServer};

pub mod prelude {
    pub use crate::client::{ClusterEvent, HostRewriter, LinkCluster, RetryPolicy, TunnelInfo};
    pub use crate::common::http_conn::{HttpRequestParser, RequestHead, RequestLine};
    pub use crate::server::{ClientSession, PoolError, PoolEvent, PooledSocket};
}

pub mod cluster;
pub mod config;
pub mod errors;
pub mod host_rewrite;
pub mod local;
pub mod registration;
pub mod session;

pub use cluster::{ClusterEvent, LinkCluster};
pub use config::{Args, LocalTls, RetryPolicy, TunnelOptions};
pub use errors::*;
pub use host_rewrite::HostRewriter;
pub use local::{LocalStream, LocalTarget};
pub use registration::{register, registration_url, TunnelInfo};
pub use session::TunnelSession;

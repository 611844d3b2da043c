//! 연결 핸들러 모듈
//!
//! Hostname routing, the management API and the public listener.

pub mod api;
pub mod host;
pub mod public;

pub use api::{routes as api_routes, ApiError, ServerStatus};
pub use host::{request_host, HostRouter};
pub use public::{dispatch, handle_public_connection, serve_public};

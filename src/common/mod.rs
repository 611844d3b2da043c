//! 공통 모듈
//!
//! Types, error helpers, and HTTP plumbing shared by the relay server and the
//! tunnel client.

pub mod errors;
pub mod http_conn;
pub mod logging;
pub mod relay;
pub mod types;

// 공통 타입들을 재내보내기
pub use errors::*;
pub use types::*;

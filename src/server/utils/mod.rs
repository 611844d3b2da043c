//! 서버 유틸리티 모듈
//!
//! Identifier generation and process status used by the management API.

pub mod process;
pub mod slug;

pub use process::*;
pub use slug::*;

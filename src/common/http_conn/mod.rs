//! HTTP/1.x helpers for the relay: head parsing, upgrade detection, and a
//! stream wrapper that replays bytes already read while sniffing.

pub mod parser;
pub mod rewind;
pub mod upgrade;

pub use parser::*;
pub use rewind::*;
pub use upgrade::*;

//! WebSocket transport: wire protocol, sessions and the connection handler

pub mod handler;
pub mod protocol;
pub mod session;

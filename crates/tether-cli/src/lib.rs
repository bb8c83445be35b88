//! Tether command-line client: configuration, logging and the HTTP and
//! WebSocket transports behind the `tether` binary.
//!
//! Kept separate from main.rs so the transports can be tested against a
//! local server.

pub mod commands;
pub mod config;
pub mod http;
pub mod logging;
pub mod ws;

pub use http::HttpTurnBackend;
pub use ws::WsTerminalTransport;

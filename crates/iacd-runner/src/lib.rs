//! Client side of the runner protocol.
//!
//! The runner accepts job submissions over HTTP and exposes two WebSocket
//! endpoints per task: a status stream (JSON frames carrying the container
//! state and the log lines produced since the requested offset) and a
//! log-follow stream (raw text frames, one log line each).

mod client;
mod protocol;
mod ws;

pub use client::*;
pub use protocol::*;
pub use ws::*;

//! WebSocket layer: the connection gateway.
//!
//! The `/ws` endpoint terminates persistent client connections and runs
//! the per-connection authentication/subscription state machine.

pub mod connection;
pub mod handler;
pub mod messages;

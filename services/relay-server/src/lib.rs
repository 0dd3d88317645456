//! Standalone signaling relay for classcast sessions
//!
//! Exposes the session-scoped publish/subscribe/ack contract over a
//! WebSocket, backed by an in-memory retained-signal store. Broadcasters and
//! viewers in separate processes connect here with the `WsRelay` client and
//! see the same at-least-once semantics tests get from the in-process relay.

#![warn(clippy::all)]

pub mod server;

pub use server::RelayServer;

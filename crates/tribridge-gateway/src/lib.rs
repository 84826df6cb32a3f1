//! QQ gateway transport for tribridge
//!
//! One persistent WebSocket carries two traffic classes: unsolicited group
//! chat events and command/response pairs correlated by token. This crate
//! implements the protocol frames, the duplex client with its send and
//! receive loops, and the adapter that plugs the client into the relay.

pub mod adapter;
pub mod client;
pub mod protocol;
pub mod segments;

// Re-export main types
pub use adapter::QqAdapter;
pub use client::{ConnectionState, DEFAULT_COMMAND_TIMEOUT, GatewayClient};

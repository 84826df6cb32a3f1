//! Transport adapters and the relay orchestrator for tribridge
//!
//! This crate defines the adapter capability contract, the relay that
//! dedups and fans messages out across transports, and the Discord and
//! Telegram adapters. The QQ gateway adapter lives in tribridge-gateway.

pub mod discord;
pub mod relay;
pub mod telegram;

// Re-export main types
pub use discord::DiscordAdapter;
pub use relay::{Relay, TransportAdapter};
pub use telegram::TelegramAdapter;

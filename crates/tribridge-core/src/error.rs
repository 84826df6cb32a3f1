//! Error taxonomy shared by every transport

use thiserror::Error;

/// Errors raised by adapters, the gateway client, and the attachment
/// pipeline.
///
/// None of these terminate the process: a `Configuration` error keeps one
/// adapter down, the rest are logged at the boundary where they occur and
/// delivery continues on the remaining transports.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required credential or setting is missing. Fatal to that adapter
    /// only.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connect or send failure on a transport. Best-effort, not retried.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected wire frame. The frame is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A pending command was not answered in time. Callers resolve with a
    /// fallback value instead of blocking.
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Transport(e.to_string())
    }
}

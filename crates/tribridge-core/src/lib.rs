//! Core types for tribridge
//!
//! This crate provides the transport-agnostic message model, the error
//! taxonomy shared by all transports, the per-source dedup window, and the
//! attachment download pipeline.

pub mod attachments;
pub mod dedup;
pub mod error;
pub mod types;

// Re-export main types
pub use attachments::AttachmentStore;
pub use dedup::DedupWindow;
pub use error::RelayError;
pub use types::{AttachmentKind, RelayMessage, TransportKind};

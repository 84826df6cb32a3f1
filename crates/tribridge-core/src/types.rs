//! Shared message model for all transports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three bridged transports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Qq,
    Discord,
    Telegram,
}

impl TransportKind {
    /// Startup ordering. The QQ gateway connects before the other adapters
    /// start listening so that early Discord/Telegram traffic cannot race
    /// its handshake.
    pub fn start_priority(self) -> u8 {
        match self {
            Self::Qq => 0,
            Self::Discord => 1,
            Self::Telegram => 2,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Qq => write!(f, "qq"),
            Self::Discord => write!(f, "discord"),
            Self::Telegram => write!(f, "telegram"),
        }
    }
}

/// Attachment categories a message can carry besides inline images.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Document,
    Audio,
    Video,
    Animation,
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Animation => write!(f, "animation"),
        }
    }
}

/// A normalized chat message as produced by any adapter.
///
/// `id` is the transport-native identifier and is unique only within its
/// source's dedup window. A message carrying an attachment may be observed
/// twice for the same logical event: once with the remote URL and once more
/// (same `id`) after the attachment pipeline localized it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: String,
    pub content: String,
    pub sender_name: String,
    pub sender_id: String,
    pub source: TransportKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<AttachmentKind>,
}

impl RelayMessage {
    pub fn new(
        id: impl Into<String>,
        sender_name: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        source: TransportKind,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            sender_name: sender_name.into(),
            sender_id: sender_id.into(),
            source,
            timestamp: Utc::now(),
            avatar_url: None,
            image_url: None,
            file_url: None,
            file_name: None,
            file_type: None,
        }
    }

    /// Content is append-only: annotations go at the end, the original text
    /// is never replaced.
    pub fn append_note(&mut self, note: &str) {
        if !self.content.is_empty() {
            self.content.push('\n');
        }
        self.content.push_str(note);
    }

    /// How the message reads when forwarded to another transport: sender
    /// prefix, text, then one line per attachment reference.
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.sender_name, self.content);
        if let Some(url) = &self.image_url {
            out.push('\n');
            out.push_str(url);
        }
        if let Some(url) = &self.file_url {
            out.push('\n');
            match &self.file_name {
                Some(name) => out.push_str(&format!("{}: {}", name, url)),
                None => out.push_str(url),
            }
        }
        out
    }

    /// Whether the message still references a remote attachment that the
    /// pipeline should localize.
    pub fn has_remote_attachment(&self) -> bool {
        let remote = |url: &String| !url.starts_with("file://");
        self.image_url.as_ref().is_some_and(remote) || self.file_url.as_ref().is_some_and(remote)
    }
}

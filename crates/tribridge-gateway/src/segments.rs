//! Rich-text decoding: flatten an ordered list of typed message parts into
//! plain text plus attachment and mention extractions

use crate::protocol::MessagePart;
use serde_json::Value;

/// The flattened form of an event body.
#[derive(Debug, Default)]
pub struct FlattenedBody {
    pub text: String,
    pub image_url: Option<String>,
    /// Mentioned user ids whose display names were not embedded in the
    /// payload. Their placeholders sit in `text` until a lookup resolves.
    pub pending_mentions: Vec<i64>,
}

/// Placeholder substituted for a mention until the name lookup round trip
/// completes.
pub fn mention_placeholder(user_id: i64) -> String {
    format!("@[{}]", user_id)
}

/// Flatten message parts in order. Only the first image reference is kept;
/// face parts render as a bracketed marker.
pub fn flatten(parts: &[MessagePart]) -> FlattenedBody {
    let mut body = FlattenedBody::default();
    for part in parts {
        match part.kind.as_str() {
            "text" => {
                if let Some(text) = part.data.get("text").and_then(Value::as_str) {
                    body.text.push_str(text);
                }
            }
            "image" => {
                if body.image_url.is_none() {
                    body.image_url = part
                        .data
                        .get("url")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
            "face" => {
                match part.data.get("id").and_then(Value::as_i64) {
                    Some(id) => body.text.push_str(&format!("[face:{}]", id)),
                    None => body.text.push_str("[face]"),
                }
            }
            "at" => {
                let user_id = part.data.get("userId").and_then(Value::as_i64);
                let name = part
                    .data
                    .get("nickname")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty());
                match (user_id, name) {
                    (_, Some(name)) => {
                        body.text.push('@');
                        body.text.push_str(name);
                    }
                    (Some(uid), None) => {
                        body.text.push_str(&mention_placeholder(uid));
                        body.pending_mentions.push(uid);
                    }
                    (None, None) => body.text.push_str("@?"),
                }
            }
            other => {
                tracing::debug!("skipping unsupported message part type {}", other);
            }
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn part(kind: &str, data: Value) -> MessagePart {
        MessagePart {
            kind: kind.to_string(),
            data,
        }
    }

    #[test]
    fn test_flatten_text_and_face() {
        let body = flatten(&[
            part("text", json!({"text": "hello "})),
            part("face", json!({"id": 14})),
            part("text", json!({"text": " world"})),
        ]);
        assert_eq!(body.text, "hello [face:14] world");
        assert!(body.image_url.is_none());
        assert!(body.pending_mentions.is_empty());
    }

    #[test]
    fn test_flatten_keeps_first_image() {
        let body = flatten(&[
            part("image", json!({"url": "https://remote/a.png"})),
            part("image", json!({"url": "https://remote/b.png"})),
        ]);
        assert_eq!(body.image_url.as_deref(), Some("https://remote/a.png"));
    }

    #[test]
    fn test_mention_with_embedded_name_resolves_inline() {
        let body = flatten(&[part("at", json!({"userId": 42, "nickname": "alice"}))]);
        assert_eq!(body.text, "@alice");
        assert!(body.pending_mentions.is_empty());
    }

    #[test]
    fn test_mention_without_name_defers() {
        let body = flatten(&[
            part("at", json!({"userId": 42})),
            part("text", json!({"text": " ping"})),
        ]);
        assert_eq!(body.text, "@[42] ping");
        assert_eq!(body.pending_mentions, vec![42]);
    }

    #[test]
    fn test_unknown_part_is_skipped() {
        let body = flatten(&[
            part("video", json!({"url": "x"})),
            part("text", json!({"text": "tail"})),
        ]);
        assert_eq!(body.text, "tail");
    }
}

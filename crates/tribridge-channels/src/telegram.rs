//! Telegram adapter: long-poll getUpdates and sendMessage via the Bot API

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::relay::TransportAdapter;
use tribridge_core::attachments::failure_note;
use tribridge_core::{AttachmentKind, AttachmentStore, RelayError, RelayMessage, TransportKind};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Option<Vec<TgPhotoSize>>,
    #[serde(default)]
    document: Option<TgFileRef>,
    #[serde(default)]
    audio: Option<TgFileRef>,
    #[serde(default)]
    video: Option<TgFileRef>,
    #[serde(default)]
    animation: Option<TgFileRef>,
}

#[derive(Debug, Default, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
    #[serde(default)]
    file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TgFileRef {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TgFile {
    #[serde(default)]
    file_path: Option<String>,
}

/// The attachment (if any) a Telegram message carries, reduced to whichever
/// single reference the relay forwards.
struct TgAttachment {
    file_id: String,
    file_name: Option<String>,
    kind: Option<AttachmentKind>, // None = inline photo
}

fn pick_attachment(msg: &TgMessage) -> Option<TgAttachment> {
    if let Some(sizes) = &msg.photo {
        // telegram sends several downscaled variants; take the largest
        let best = sizes.iter().max_by_key(|s| s.file_size.unwrap_or(0))?;
        return Some(TgAttachment {
            file_id: best.file_id.clone(),
            file_name: None,
            kind: None,
        });
    }
    let (file, kind) = if let Some(f) = &msg.document {
        (f, AttachmentKind::Document)
    } else if let Some(f) = &msg.audio {
        (f, AttachmentKind::Audio)
    } else if let Some(f) = &msg.video {
        (f, AttachmentKind::Video)
    } else if let Some(f) = &msg.animation {
        (f, AttachmentKind::Animation)
    } else {
        return None;
    };
    Some(TgAttachment {
        file_id: file.file_id.clone(),
        file_name: file.file_name.clone(),
        kind: Some(kind),
    })
}

/// Put a resolved attachment URL on the message, or annotate the loss so
/// downstream transports still learn an attachment existed.
fn apply_attachment(out: &mut RelayMessage, att: TgAttachment, resolved: Result<String, RelayError>) {
    match resolved {
        Ok(url) => match att.kind {
            None => out.image_url = Some(url),
            Some(kind) => {
                out.file_url = Some(url);
                out.file_name = att.file_name;
                out.file_type = Some(kind);
            }
        },
        Err(e) => {
            warn!("could not resolve telegram file {}: {}", att.file_id, e);
            let kind = att
                .kind
                .map_or_else(|| "image".to_string(), |k| k.to_string());
            let name = att.file_name.as_deref().unwrap_or("attachment");
            out.append_note(&failure_note(&kind, name, &e));
        }
    }
}

fn sender_name(user: &TgUser) -> String {
    match (&user.last_name, &user.username) {
        (Some(last), _) => format!("{} {}", user.first_name, last),
        (None, Some(username)) if user.first_name.is_empty() => username.clone(),
        _ => user.first_name.clone(),
    }
}

/// Convert a Telegram message to the relay model. Returns None for
/// messages outside the bridged chat, without a sender, or authored by the
/// relay's own bot identity.
fn convert(msg: &TgMessage, chat_id: i64, bot_id: i64) -> Option<RelayMessage> {
    if msg.chat.id != chat_id {
        return None;
    }
    let from = msg.from.as_ref()?;
    if from.id == bot_id {
        return None;
    }
    let text = msg
        .text
        .clone()
        .or_else(|| msg.caption.clone())
        .unwrap_or_default();
    Some(RelayMessage::new(
        msg.message_id.to_string(),
        sender_name(from),
        from.id.to_string(),
        text,
        TransportKind::Telegram,
    ))
}

/// Telegram transport adapter bridging one chat
pub struct TelegramAdapter {
    token: String,
    chat_id: i64,
    poll_timeout_secs: u64,
    store: Arc<AttachmentStore>,
    client: reqwest::Client,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl TelegramAdapter {
    pub fn new(token: String, chat_id: i64, poll_timeout_secs: u64, store: Arc<AttachmentStore>) -> Self {
        let poll_timeout_secs = if poll_timeout_secs == 0 {
            DEFAULT_POLL_TIMEOUT_SECS
        } else {
            poll_timeout_secs
        };
        Self {
            token,
            chat_id,
            poll_timeout_secs,
            store,
            client: reqwest::Client::new(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<(Vec<TgUpdate>, Option<i64>), RelayError> {
        let mut url = format!(
            "{}/bot{}/getUpdates?timeout={}",
            TELEGRAM_API_BASE, self.token, self.poll_timeout_secs
        );
        if let Some(off) = offset {
            url.push_str(&format!("&offset={}", off));
        }
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "getUpdates failed: {}",
                response.status()
            )));
        }
        let body: ApiResponse<Vec<TgUpdate>> = response.json().await?;
        if !body.ok {
            return Err(RelayError::Transport("getUpdates returned ok: false".to_string()));
        }
        let updates = body.result.unwrap_or_default();
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }

    /// Who the bot itself is, for the self-filter. The Bot API never
    /// replays the bot's own sends through getUpdates, but the guard stays
    /// in case a forwarded copy slips through.
    async fn get_me(&self) -> Result<i64, RelayError> {
        let url = format!("{}/bot{}/getMe", TELEGRAM_API_BASE, self.token);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "getMe failed: {}",
                response.status()
            )));
        }
        let body: ApiResponse<TgUser> = response.json().await?;
        let ok = body.ok;
        body.result
            .filter(|_| ok)
            .map(|user| user.id)
            .ok_or_else(|| RelayError::Transport("getMe returned no user".to_string()))
    }

    /// Resolve a file_id to a fetchable URL via getFile.
    async fn file_url(&self, file_id: &str) -> Result<String, RelayError> {
        let url = format!(
            "{}/bot{}/getFile?file_id={}",
            TELEGRAM_API_BASE, self.token, file_id
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "getFile failed: {}",
                response.status()
            )));
        }
        let body: ApiResponse<TgFile> = response.json().await?;
        let file_path = body
            .result
            .and_then(|f| f.file_path)
            .ok_or_else(|| RelayError::Transport("getFile returned no path".to_string()))?;
        Ok(format!(
            "{}/file/bot{}/{}",
            TELEGRAM_API_BASE, self.token, file_path
        ))
    }

    /// Handle one update: normalize, emit with the remote URL, then emit a
    /// corrected copy once the attachment pipeline resolves.
    async fn handle_update(&self, update: TgUpdate, bot_id: i64, tx: &mpsc::Sender<RelayMessage>) {
        let Some(tg_msg) = update.message else {
            return;
        };
        let Some(mut out) = convert(&tg_msg, self.chat_id, bot_id) else {
            return;
        };

        if let Some(att) = pick_attachment(&tg_msg) {
            let resolved = self.file_url(&att.file_id).await;
            apply_attachment(&mut out, att, resolved);
        }

        debug!("message {} from {} on telegram", out.id, out.sender_name);

        let enrich = out.has_remote_attachment();
        if tx.send(out.clone()).await.is_err() {
            error!("failed to send telegram message to relay");
            return;
        }

        if enrich {
            let store = self.store.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut corrected = out;
                store.localize(&mut corrected).await;
                if tx.send(corrected).await.is_err() {
                    error!("failed to send corrected telegram message to relay");
                }
            });
        }
    }
}

#[async_trait]
impl TransportAdapter for TelegramAdapter {
    async fn initialize(&self) -> Result<(), RelayError> {
        if self.token.is_empty() {
            return Err(RelayError::Configuration(
                "telegram bot token is empty".to_string(),
            ));
        }
        if self.chat_id == 0 {
            return Err(RelayError::Configuration(
                "telegram chat id not set".to_string(),
            ));
        }
        Ok(())
    }

    async fn start(&self, tx: mpsc::Sender<RelayMessage>) -> Result<(), RelayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("telegram adapter already started");
            return Ok(());
        }
        info!("starting telegram adapter (long-poll, timeout {}s)", self.poll_timeout_secs);

        // rebuild a poller instance for the task, like the other polling
        // adapters do
        let poller = TelegramAdapter {
            token: self.token.clone(),
            chat_id: self.chat_id,
            poll_timeout_secs: self.poll_timeout_secs,
            store: self.store.clone(),
            client: self.client.clone(),
            started: AtomicBool::new(true),
            cancel: self.cancel.clone(),
        };

        tokio::spawn(async move {
            let bot_id = match poller.get_me().await {
                Ok(id) => id,
                Err(e) => {
                    // the self-filter guard degrades; getUpdates omits the
                    // bot's own sends anyway
                    warn!("telegram getMe failed, self-filter by id disabled: {}", e);
                    0
                }
            };

            let mut offset: Option<i64> = None;
            loop {
                tokio::select! {
                    _ = poller.cancel.cancelled() => {
                        info!("telegram polling loop stopped");
                        break;
                    }
                    polled = poller.get_updates(offset) => match polled {
                        Ok((updates, next)) => {
                            // offset acknowledges everything received; this
                            // transport-level last-seen guard is separate
                            // from the relay's cross-transport dedup
                            offset = next.or(offset);
                            for update in updates {
                                poller.handle_update(update, bot_id, &tx).await;
                            }
                        }
                        Err(e) => {
                            warn!("telegram getUpdates error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_BASE, self.token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": msg.render(),
        });
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "sendMessage failed: {}",
                response.status()
            )));
        }
        debug!("forwarded message {} to telegram", msg.id);
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Telegram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribridge_core::attachments::DEFAULT_RETENTION;

    fn store() -> Arc<AttachmentStore> {
        Arc::new(AttachmentStore::new(None, DEFAULT_RETENTION))
    }

    fn tg_message(json: serde_json::Value) -> TgMessage {
        serde_json::from_value(json).expect("valid message")
    }

    #[test]
    fn test_telegram_creation() {
        let adapter = TelegramAdapter::new("token".to_string(), -100, 30, store());
        assert!(matches!(adapter.transport(), TransportKind::Telegram));
    }

    #[tokio::test]
    async fn test_initialize_rejects_missing_credentials() {
        let adapter = TelegramAdapter::new(String::new(), -100, 30, store());
        assert!(matches!(
            adapter.initialize().await,
            Err(RelayError::Configuration(_))
        ));

        let adapter = TelegramAdapter::new("token".to_string(), 0, 30, store());
        assert!(matches!(
            adapter.initialize().await,
            Err(RelayError::Configuration(_))
        ));
    }

    #[test]
    fn test_convert_text_message() {
        let msg = tg_message(serde_json::json!({
            "message_id": 7,
            "from": {"id": 500, "first_name": "Ann", "last_name": "Lee"},
            "chat": {"id": -100},
            "text": "hello"
        }));
        let out = convert(&msg, -100, 999).expect("converted");
        assert_eq!(out.id, "7");
        assert_eq!(out.sender_name, "Ann Lee");
        assert_eq!(out.sender_id, "500");
        assert_eq!(out.content, "hello");
        assert_eq!(out.source, TransportKind::Telegram);
    }

    #[test]
    fn test_convert_filters_own_and_foreign_chat() {
        let own = tg_message(serde_json::json!({
            "message_id": 8,
            "from": {"id": 999, "first_name": "Bridge"},
            "chat": {"id": -100},
            "text": "echo"
        }));
        assert!(convert(&own, -100, 999).is_none());

        let elsewhere = tg_message(serde_json::json!({
            "message_id": 9,
            "from": {"id": 500, "first_name": "Ann"},
            "chat": {"id": -200},
            "text": "hi"
        }));
        assert!(convert(&elsewhere, -100, 999).is_none());
    }

    #[test]
    fn test_convert_uses_caption_when_no_text() {
        let msg = tg_message(serde_json::json!({
            "message_id": 10,
            "from": {"id": 500, "first_name": "Ann"},
            "chat": {"id": -100},
            "caption": "look at this",
            "photo": [{"file_id": "small", "file_size": 10}, {"file_id": "big", "file_size": 99}]
        }));
        let out = convert(&msg, -100, 999).expect("converted");
        assert_eq!(out.content, "look at this");

        let att = pick_attachment(&msg).expect("attachment");
        assert_eq!(att.file_id, "big");
        assert!(att.kind.is_none());
    }

    #[test]
    fn test_pick_attachment_kinds() {
        let doc = tg_message(serde_json::json!({
            "message_id": 11,
            "chat": {"id": -100},
            "document": {"file_id": "d1", "file_name": "notes.pdf"}
        }));
        let att = pick_attachment(&doc).expect("attachment");
        assert_eq!(att.kind, Some(AttachmentKind::Document));
        assert_eq!(att.file_name.as_deref(), Some("notes.pdf"));

        let anim = tg_message(serde_json::json!({
            "message_id": 12,
            "chat": {"id": -100},
            "animation": {"file_id": "a1"}
        }));
        assert_eq!(
            pick_attachment(&anim).expect("attachment").kind,
            Some(AttachmentKind::Animation)
        );
    }

    #[test]
    fn test_unresolved_attachment_is_annotated() {
        let msg = tg_message(serde_json::json!({
            "message_id": 13,
            "from": {"id": 500, "first_name": "Ann"},
            "chat": {"id": -100},
            "caption": "see attached",
            "document": {"file_id": "d1", "file_name": "notes.pdf"}
        }));
        let mut out = convert(&msg, -100, 999).expect("converted");
        let att = pick_attachment(&msg).expect("attachment");

        apply_attachment(
            &mut out,
            att,
            Err(RelayError::Transport("getFile failed: 401".to_string())),
        );

        assert!(out.file_url.is_none());
        assert_eq!(
            out.content,
            "see attached\n[document 'notes.pdf' unavailable: transport]"
        );
    }

    #[test]
    fn test_sender_name_fallbacks() {
        let user: TgUser = serde_json::from_value(serde_json::json!({
            "id": 1, "first_name": "", "username": "ann_l"
        }))
        .expect("user");
        assert_eq!(sender_name(&user), "ann_l");
    }
}

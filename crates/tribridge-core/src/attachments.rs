//! Attachment download and localization
//!
//! Adapters hand remote attachment references here. Files land in a
//! process-local temp directory under a collision-avoiding name and are
//! deleted after a fixed retention window whether or not the message was
//! ever forwarded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::types::{AttachmentKind, RelayMessage};

/// Default retention before a downloaded file is deleted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Downloads remote attachments into a temp directory and rewrites message
/// URL fields to local `file://` references.
pub struct AttachmentStore {
    dir: PathBuf,
    retention: Duration,
    client: reqwest::Client,
    downloaded: Arc<Mutex<Vec<PathBuf>>>,
}

impl AttachmentStore {
    /// Create a store rooted at `dir` (defaults to a `tribridge` folder in
    /// the system temp directory).
    pub fn new(dir: Option<PathBuf>, retention: Duration) -> Self {
        let dir = dir.unwrap_or_else(|| std::env::temp_dir().join("tribridge"));
        Self {
            dir,
            retention,
            client: reqwest::Client::new(),
            downloaded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Download `url` into the store. Deletion is scheduled as soon as the
    /// download lands, independent of forwarding.
    pub async fn download(&self, url: &str, suggested_name: &str) -> Result<PathBuf, RelayError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "http_{}",
                response.status().as_u16()
            )));
        }
        let bytes = response.bytes().await?;

        let path = self
            .dir
            .join(local_name(suggested_name, Utc::now().timestamp()));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        debug!("downloaded {} -> {} ({} bytes)", url, path.display(), bytes.len());

        self.downloaded.lock().await.push(path.clone());

        let retained = path.clone();
        let retention = self.retention;
        let downloaded = self.downloaded.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Err(e) = tokio::fs::remove_file(&retained).await {
                debug!("retention cleanup of {} failed: {}", retained.display(), e);
            }
            // the ledger entry goes with the file, otherwise a long-running
            // daemon accumulates one path per attachment
            downloaded.lock().await.retain(|p| p != &retained);
        });

        Ok(path)
    }

    /// Localize every remote attachment the message carries, rewriting URL
    /// fields in place. Failures never escape the pipeline: the URL is
    /// cleared and a deterministic annotation is appended to the content so
    /// downstream transports never re-fetch a broken link.
    pub async fn localize(&self, msg: &mut RelayMessage) {
        if let Some(url) = msg.image_url.clone() {
            let name = file_name_from_url(&url).unwrap_or_else(|| "image".to_string());
            match self.download(&url, &name).await {
                Ok(path) => msg.image_url = Some(format!("file://{}", path.display())),
                Err(e) => {
                    warn!("image download failed for {}: {}", url, e);
                    msg.image_url = None;
                    msg.append_note(&failure_note("image", &name, &e));
                }
            }
        }
        if let Some(url) = msg.file_url.clone() {
            let kind = msg.file_type.unwrap_or(AttachmentKind::Document);
            let name = msg
                .file_name
                .clone()
                .or_else(|| file_name_from_url(&url))
                .unwrap_or_else(|| "file".to_string());
            match self.download(&url, &name).await {
                Ok(path) => msg.file_url = Some(format!("file://{}", path.display())),
                Err(e) => {
                    warn!("{} download failed for {}: {}", kind, url, e);
                    msg.file_url = None;
                    msg.append_note(&failure_note(&kind.to_string(), &name, &e));
                }
            }
        }
    }

    /// Delete every file downloaded so far, ahead of their retention timers.
    pub async fn cleanup_all(&self) {
        let files: Vec<PathBuf> = self.downloaded.lock().await.drain(..).collect();
        for path in files {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!("cleanup of {} failed: {}", path.display(), e);
            }
        }
    }
}

/// Collision-avoiding local filename: original stem plus a timestamp suffix.
fn local_name(suggested: &str, ts: i64) -> String {
    let path = Path::new(suggested);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("attachment");
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, ts, ext),
        None => format!("{}_{}", stem, ts),
    }
}

/// Stable, human-readable failure annotation: attachment kind, original
/// name, opaque error code. Adapters reuse it when a transport-side file
/// lookup fails before the download stage.
pub fn failure_note(kind: &str, name: &str, err: &RelayError) -> String {
    format!("[{} '{}' unavailable: {}]", kind, name, error_code(err))
}

/// Short code for annotations. Stable across runs for the same failure
/// class so forwarded annotations stay comparable.
fn error_code(err: &RelayError) -> String {
    match err {
        RelayError::Transport(detail) if detail.starts_with("http_") => detail.clone(),
        RelayError::Transport(_) => "transport".to_string(),
        RelayError::Timeout(_) => "timeout".to_string(),
        RelayError::Protocol(_) => "protocol".to_string(),
        RelayError::Configuration(_) => "config".to_string(),
    }
}

fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let name = parsed.path_segments()?.next_back()?.to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    #[test]
    fn test_local_name_keeps_extension() {
        assert_eq!(local_name("img.png", 1699999), "img_1699999.png");
        assert_eq!(local_name("notes", 42), "notes_42");
        assert_eq!(local_name("", 42), "attachment_42");
    }

    #[test]
    fn test_failure_note_is_deterministic() {
        let err = RelayError::Transport("http_404".to_string());
        assert_eq!(
            failure_note("image", "img.png", &err),
            "[image 'img.png' unavailable: http_404]"
        );
        let timeout = RelayError::Timeout("download".to_string());
        assert_eq!(
            failure_note("document", "notes.pdf", &timeout),
            "[document 'notes.pdf' unavailable: timeout]"
        );
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://remote/path/img.png"),
            Some("img.png".to_string())
        );
        assert_eq!(file_name_from_url("https://remote/"), None);
        assert_eq!(file_name_from_url("not a url"), None);
    }

    #[tokio::test]
    async fn test_localize_failure_clears_url_and_annotates() {
        // nothing listens on port 9; the connect fails fast
        let store = AttachmentStore::new(None, DEFAULT_RETENTION);
        let mut msg = RelayMessage::new("1", "alice", "100", "look", TransportKind::Qq);
        msg.image_url = Some("http://127.0.0.1:9/img.png".to_string());

        store.localize(&mut msg).await;

        assert!(msg.image_url.is_none());
        assert!(msg.content.starts_with("look\n[image 'img.png' unavailable:"));
    }

    #[tokio::test]
    async fn test_localize_failure_annotates_file_kind() {
        let store = AttachmentStore::new(None, DEFAULT_RETENTION);
        let mut msg = RelayMessage::new("2", "alice", "100", "", TransportKind::Qq);
        msg.file_url = Some("http://127.0.0.1:9/voice.ogg".to_string());
        msg.file_name = Some("voice.ogg".to_string());
        msg.file_type = Some(AttachmentKind::Audio);

        store.localize(&mut msg).await;

        assert!(msg.file_url.is_none());
        assert!(msg.content.starts_with("[audio 'voice.ogg' unavailable:"));
    }

    #[tokio::test]
    async fn test_retention_removes_file_and_ledger_entry() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // one-shot server serving a tiny body
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nbytes",
                    )
                    .await;
            }
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let store = AttachmentStore::new(
            Some(dir.path().to_path_buf()),
            Duration::from_millis(50),
        );
        let path = store
            .download(&format!("http://{}/img.png", addr), "img.png")
            .await
            .expect("download");
        assert!(path.exists());
        assert_eq!(store.downloaded.lock().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!path.exists());
        assert!(store.downloaded.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_removes_downloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AttachmentStore::new(Some(dir.path().to_path_buf()), DEFAULT_RETENTION);

        // seed the ledger directly; download() needs a live server
        let path = dir.path().join("img_1.png");
        tokio::fs::write(&path, b"bytes").await.expect("write");
        store.downloaded.lock().await.push(path.clone());

        store.cleanup_all().await;
        assert!(!path.exists());
        assert!(store.downloaded.lock().await.is_empty());
    }
}

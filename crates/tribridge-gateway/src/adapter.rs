//! Relay adapter wrapping the gateway client

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{ConnectionState, GatewayClient};
use tribridge_channels::TransportAdapter;
use tribridge_core::{AttachmentStore, RelayError, RelayMessage, TransportKind};

/// QQ transport adapter bridging one group through the gateway socket.
pub struct QqAdapter {
    url: String,
    group_id: i64,
    client: Mutex<GatewayClient>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl QqAdapter {
    pub fn new(
        url: String,
        self_id: i64,
        group_id: i64,
        store: Arc<AttachmentStore>,
        command_timeout: Duration,
    ) -> Self {
        let client = GatewayClient::new(url.clone(), self_id, group_id, store, command_timeout);
        Self {
            url,
            group_id,
            client: Mutex::new(client),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl TransportAdapter for QqAdapter {
    async fn initialize(&self) -> Result<(), RelayError> {
        if self.url.is_empty() {
            return Err(RelayError::Configuration(
                "gateway url is empty".to_string(),
            ));
        }
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| RelayError::Configuration(format!("invalid gateway url: {}", e)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RelayError::Configuration(format!(
                "gateway url must be ws:// or wss://, got {}",
                parsed.scheme()
            )));
        }
        if self.group_id == 0 {
            return Err(RelayError::Configuration(
                "gateway group id not set".to_string(),
            ));
        }

        self.client.lock().await.connect().await
    }

    async fn start(&self, tx: mpsc::Sender<RelayMessage>) -> Result<(), RelayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("qq adapter already started");
            return Ok(());
        }
        info!("starting qq adapter for group {}", self.group_id);

        let mut events = self
            .client
            .lock()
            .await
            .take_events()
            .ok_or_else(|| RelayError::Transport("gateway event stream already taken".to_string()))?;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(msg) => {
                            if tx.send(msg).await.is_err() {
                                error!("failed to send qq message to relay");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            info!("qq event loop stopped");
        });

        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.client.lock().await.close();
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
        let client = self.client.lock().await;
        if client.state() != ConnectionState::Open {
            return Err(RelayError::Transport(
                "gateway is not connected".to_string(),
            ));
        }
        client.send_group_message(&msg.render())?;
        debug!("forwarded message {} to qq", msg.id);
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Qq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_COMMAND_TIMEOUT;
    use tribridge_core::attachments::DEFAULT_RETENTION;

    fn store() -> Arc<AttachmentStore> {
        Arc::new(AttachmentStore::new(None, DEFAULT_RETENTION))
    }

    fn adapter(url: &str, group_id: i64) -> QqAdapter {
        QqAdapter::new(
            url.to_string(),
            999,
            group_id,
            store(),
            DEFAULT_COMMAND_TIMEOUT,
        )
    }

    #[test]
    fn test_qq_creation() {
        let adapter = adapter("ws://127.0.0.1:8080/gateway", 12345);
        assert!(matches!(adapter.transport(), TransportKind::Qq));
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_config() {
        assert!(matches!(
            adapter("", 12345).initialize().await,
            Err(RelayError::Configuration(_))
        ));
        assert!(matches!(
            adapter("http://127.0.0.1:8080", 12345).initialize().await,
            Err(RelayError::Configuration(_))
        ));
        assert!(matches!(
            adapter("ws://127.0.0.1:8080/gateway", 0).initialize().await,
            Err(RelayError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_transport_error() {
        let adapter = adapter("ws://127.0.0.1:8080/gateway", 12345);
        let msg = RelayMessage::new("1", "alice", "100", "hi", TransportKind::Discord);
        assert!(matches!(
            adapter.send(&msg).await,
            Err(RelayError::Transport(_))
        ));
    }
}

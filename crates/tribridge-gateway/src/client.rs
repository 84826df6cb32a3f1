//! Duplex gateway client
//!
//! One WebSocket, two loops. The send loop drains an outbound queue so
//! callers enqueue and return immediately; the receive loop parses each
//! inbound frame and either resolves a pending command handle by its
//! correlation token or converts a chat event into a relay message.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::DateTime;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use lru::LruCache;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{CommandFrame, EventFrame, Frame, parse_frame};
use crate::segments;
use tribridge_core::{AttachmentStore, RelayError, RelayMessage, TransportKind};

/// Bound on the wait for a command response.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Recent event ids kept to drop gateway redeliveries. This guard is local
/// to the connection; the relay's cross-transport dedup is a separate layer.
const EVENT_GUARD_CAPACITY: NonZeroUsize = NonZeroUsize::new(256).unwrap();

const EVENT_BUFFER: usize = 256;

/// Connection lifecycle. Reconnection is never automatic; a client that
/// reaches `Disconnected` stays there until a caller connects again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// State shared between the client handle and its two loops.
struct Shared {
    url: String,
    self_id: i64,
    group_id: i64,
    command_timeout: Duration,
    state: StdMutex<ConnectionState>,
    out_tx: mpsc::UnboundedSender<String>,
    pending: DashMap<String, oneshot::Sender<Value>>,
    events_tx: mpsc::Sender<RelayMessage>,
    seen_events: StdMutex<LruCache<i64, ()>>,
    store: Arc<AttachmentStore>,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!("gateway state {:?} -> {:?}", *guard, next);
        *guard = next;
    }

    /// Terminal transition. Dropping the pending senders resolves every
    /// outstanding call with its fallback instead of leaving it to the
    /// timeout.
    fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.pending.clear();
    }

    /// Issue a correlated command and wait for its response. Resolves with
    /// `fallback` on timeout, serialization failure, or disconnect; callers
    /// never block past the configured bound.
    async fn call(&self, action: &str, params: Value, fallback: Value) -> Value {
        let token = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token.clone(), tx);

        let frame = CommandFrame {
            action: action.to_string(),
            correlation_token: Some(token.clone()),
            params,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("could not serialize {} command: {}", action, e);
                self.pending.remove(&token);
                return fallback;
            }
        };
        if self.out_tx.send(text).is_err() {
            self.pending.remove(&token);
            return fallback;
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(value)) => value,
            _ => {
                debug!("{} command {} resolved with fallback", action, token);
                self.pending.remove(&token);
                fallback
            }
        }
    }

    /// Look up a member's display name in the bridged group, falling back
    /// to the bare id.
    async fn member_name(&self, user_id: i64) -> String {
        let data = self
            .call(
                "get_group_member_info",
                json!({"groupId": self.group_id, "userId": user_id}),
                Value::Null,
            )
            .await;
        for key in ["card", "nickname"] {
            if let Some(name) = data.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()) {
                return name.to_string();
            }
        }
        user_id.to_string()
    }

    /// Route one inbound frame by shape. Malformed frames are dropped.
    async fn dispatch(self: Arc<Self>, raw: &str) {
        match parse_frame(raw) {
            Ok(Frame::Response(resp)) => {
                let Some(token) = resp.correlation_token else {
                    debug!("response without correlation token, status {}", resp.status);
                    return;
                };
                match self.pending.remove(&token) {
                    Some((_, tx)) => {
                        let _ = tx.send(resp.data);
                    }
                    None => debug!("response for unknown or expired token {}", token),
                }
            }
            Ok(Frame::Event(event)) => self.handle_event(event).await,
            Err(e) => warn!("dropping malformed gateway frame: {}", e),
        }
    }

    async fn handle_event(self: Arc<Self>, event: EventFrame) {
        if event.event_type != "message" || event.chat_type != "group" {
            return;
        }
        if event.group_id != self.group_id {
            return;
        }
        if event.sender.user_id == self.self_id {
            return;
        }
        {
            let mut seen = match self.seen_events.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if seen.put(event.message_id, ()).is_some() {
                debug!("gateway redelivered event {}", event.message_id);
                return;
            }
        }

        let body = segments::flatten(&event.message_parts);
        let sender_name = if event.sender.nickname.is_empty() {
            event.sender.user_id.to_string()
        } else {
            event.sender.nickname.clone()
        };
        let mut out = RelayMessage::new(
            event.message_id.to_string(),
            sender_name,
            event.sender.user_id.to_string(),
            body.text,
            TransportKind::Qq,
        );
        out.image_url = body.image_url;

        // the gateway stamps events at origin; keep that over arrival time
        if event.time > 0 {
            if let Some(ts) = DateTime::from_timestamp(event.time, 0) {
                out.timestamp = ts;
            }
        }

        debug!("message {} from {} on qq", out.id, out.sender_name);

        let mentions = body.pending_mentions;
        let enrich = !mentions.is_empty() || out.has_remote_attachment();
        if self.events_tx.send(out.clone()).await.is_err() {
            error!("failed to send gateway message to relay");
            return;
        }

        // corrected copy once name lookups and the attachment pipeline
        // finish; same id, the relay dedups it
        if enrich {
            let shared = self.clone();
            tokio::spawn(async move {
                let mut corrected = out;
                for uid in mentions {
                    let name = shared.member_name(uid).await;
                    corrected.content = corrected
                        .content
                        .replace(&segments::mention_placeholder(uid), &format!("@{}", name));
                }
                shared.store.localize(&mut corrected).await;
                if shared.events_tx.send(corrected).await.is_err() {
                    error!("failed to send corrected gateway message to relay");
                }
            });
        }
    }
}

/// Handle to one gateway connection.
pub struct GatewayClient {
    shared: Arc<Shared>,
    out_rx: Option<mpsc::UnboundedReceiver<String>>,
    events_rx: Option<mpsc::Receiver<RelayMessage>>,
}

impl GatewayClient {
    pub fn new(
        url: String,
        self_id: i64,
        group_id: i64,
        store: Arc<AttachmentStore>,
        command_timeout: Duration,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                url,
                self_id,
                group_id,
                command_timeout,
                state: StdMutex::new(ConnectionState::Disconnected),
                out_tx,
                pending: DashMap::new(),
                events_tx,
                seen_events: StdMutex::new(LruCache::new(EVENT_GUARD_CAPACITY)),
                store,
                cancel: CancellationToken::new(),
            }),
            out_rx: Some(out_rx),
            events_rx: Some(events_rx),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Take the inbound message stream. Yields each normalized group chat
    /// message once, plus corrected copies for enriched messages.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<RelayMessage>> {
        self.events_rx.take()
    }

    /// Open the socket and start the send and receive loops.
    pub async fn connect(&mut self) -> Result<(), RelayError> {
        let out_rx = self
            .out_rx
            .take()
            .ok_or_else(|| RelayError::Transport("gateway already connected".to_string()))?;

        self.shared.set_state(ConnectionState::Connecting);
        let (ws, _) = match connect_async(&self.shared.url).await {
            Ok(connected) => connected,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(RelayError::Transport(format!(
                    "gateway connect to {} failed: {}",
                    self.shared.url, e
                )));
            }
        };
        info!("gateway connected to {}", self.shared.url);
        self.shared.set_state(ConnectionState::Open);

        let (mut sink, mut stream) = ws.split();

        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            let mut out_rx = out_rx;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = sink.send(WsMessage::Close(None)).await {
                            debug!("gateway close frame not sent: {}", e);
                        }
                        break;
                    }
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                error!("gateway send failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("gateway send loop exited");
        });

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => shared.clone().dispatch(&text).await,
                    Ok(WsMessage::Close(_)) => {
                        info!("gateway closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("gateway receive error: {}", e);
                        break;
                    }
                }
            }
            shared.mark_disconnected();
            debug!("gateway receive loop exited");
        });

        Ok(())
    }

    /// Graceful shutdown: the send loop writes a close frame, every pending
    /// command resolves with its fallback.
    pub fn close(&self) {
        self.shared.set_state(ConnectionState::Closing);
        self.shared.cancel.cancel();
        self.shared.mark_disconnected();
    }

    /// Fetch the member's display name in the bridged group.
    pub async fn member_name(&self, user_id: i64) -> String {
        self.shared.member_name(user_id).await
    }

    /// List the groups visible to the gateway account.
    pub async fn list_groups(&self) -> Value {
        self.shared
            .call("get_group_list", json!({}), Value::Array(Vec::new()))
            .await
    }

    /// Fire-and-forget group send; no correlation token, no response.
    pub fn send_group_message(&self, text: &str) -> Result<(), RelayError> {
        let frame = CommandFrame {
            action: "send_group_msg".to_string(),
            correlation_token: None,
            params: json!({"groupId": self.shared.group_id, "message": text}),
        };
        let text = serde_json::to_string(&frame)?;
        self.shared
            .out_tx
            .send(text)
            .map_err(|_| RelayError::Transport("gateway send queue closed".to_string()))
    }
}

//! Discord adapter using Serenity

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serenity::{
    async_trait, gateway::GatewayError, model::gateway::Ready, model::prelude::*, prelude::*,
};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::relay::TransportAdapter;
use tribridge_core::{AttachmentKind, AttachmentStore, RelayError, RelayMessage, TransportKind};

/// Type key for storing the relay's inbound sender in Serenity's TypeMap
struct RelaySender;

impl TypeMapKey for RelaySender {
    type Value = mpsc::Sender<RelayMessage>;
}

/// Type key for the single bridged channel id
struct BridgedChannel;

impl TypeMapKey for BridgedChannel {
    type Value = ChannelId;
}

/// Type key for the attachment pipeline handle
struct StoreKey;

impl TypeMapKey for StoreKey {
    type Value = Arc<AttachmentStore>;
}

/// Event handler converting Discord messages to relay messages
struct DiscordHandler;

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        // covers the relay's own sends and every other bot
        if msg.author.bot {
            return;
        }

        let data = ctx.data.read().await;
        let bridged = match data.get::<BridgedChannel>() {
            Some(id) => *id,
            None => {
                error!("BridgedChannel not initialized in TypeMap");
                return;
            }
        };
        if msg.channel_id != bridged {
            return;
        }
        let tx = match data.get::<RelaySender>() {
            Some(tx) => tx.clone(),
            None => {
                error!("RelaySender not initialized in TypeMap");
                return;
            }
        };
        let store = match data.get::<StoreKey>() {
            Some(store) => store.clone(),
            None => {
                error!("StoreKey not initialized in TypeMap");
                return;
            }
        };
        drop(data);

        debug!("message {} from {} on discord", msg.id, msg.author.name);

        let mut out = RelayMessage::new(
            msg.id.to_string(),
            msg.author
                .global_name
                .clone()
                .unwrap_or_else(|| msg.author.name.clone()),
            msg.author.id.to_string(),
            msg.content.clone(),
            TransportKind::Discord,
        );
        out.avatar_url = msg.author.avatar_url();
        if let Some(att) = msg.attachments.first() {
            attach(&mut out, att);
        }

        let enrich = out.has_remote_attachment();
        if tx.send(out.clone()).await.is_err() {
            error!("failed to send discord message to relay");
            return;
        }

        // two-phase: the remote-URL emission above goes out immediately, a
        // corrected copy with the localized reference follows
        if enrich {
            tokio::spawn(async move {
                let mut corrected = out;
                store.localize(&mut corrected).await;
                if tx.send(corrected).await.is_err() {
                    error!("failed to send corrected discord message to relay");
                }
            });
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("discord bot connected as {}", ready.user.name);
    }
}

/// Map a Discord attachment onto the relay message's attachment fields.
fn attach(msg: &mut RelayMessage, att: &Attachment) {
    let content_type = att.content_type.as_deref().unwrap_or("");
    if content_type.starts_with("image/gif") {
        msg.file_url = Some(att.url.clone());
        msg.file_name = Some(att.filename.clone());
        msg.file_type = Some(AttachmentKind::Animation);
    } else if content_type.starts_with("image/") {
        msg.image_url = Some(att.url.clone());
    } else {
        msg.file_url = Some(att.url.clone());
        msg.file_name = Some(att.filename.clone());
        msg.file_type = Some(attachment_kind(content_type));
    }
}

fn attachment_kind(content_type: &str) -> AttachmentKind {
    if content_type.starts_with("audio/") {
        AttachmentKind::Audio
    } else if content_type.starts_with("video/") {
        AttachmentKind::Video
    } else {
        AttachmentKind::Document
    }
}

/// Check if a serenity error represents a fatal gateway condition that
/// should not be retried
fn is_fatal_gateway_error(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Gateway(gateway_err) => matches!(
            gateway_err,
            GatewayError::InvalidAuthentication
                | GatewayError::NoAuthentication
                | GatewayError::InvalidShardData
                | GatewayError::DisallowedGatewayIntents
                | GatewayError::InvalidGatewayIntents
        ),
        _ => false,
    }
}

/// Serenity client loop with reconnect backoff. Exits on a fatal gateway
/// error or as soon as the shutdown token fires, including mid-backoff and
/// before the first client (and its shard manager) exists.
async fn run_client_loop(
    token: String,
    channel_id: ChannelId,
    store: Arc<AttachmentStore>,
    tx: mpsc::Sender<RelayMessage>,
    http_arc: Arc<RwLock<Option<Arc<serenity::http::Http>>>>,
    shards_arc: Arc<RwLock<Option<Arc<serenity::gateway::ShardManager>>>>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(60);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

        let mut client = match Client::builder(&token, intents)
            .event_handler(DiscordHandler)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                if is_fatal_gateway_error(&e) {
                    error!("discord fatal error (will not retry): {}", e);
                    break;
                }
                error!("failed to create discord client: {}", e);
                warn!("retrying in {:?}", backoff);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };

        {
            let mut data = client.data.write().await;
            data.insert::<RelaySender>(tx.clone());
            data.insert::<BridgedChannel>(channel_id);
            data.insert::<StoreKey>(store.clone());
        }
        {
            let mut http_guard = http_arc.write().await;
            *http_guard = Some(client.http.clone());
        }
        {
            let mut shard_guard = shards_arc.write().await;
            *shard_guard = Some(client.shard_manager.clone());
        }

        let shard_manager = client.shard_manager.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                shard_manager.shutdown_all().await;
                break;
            }
            result = client.start() => match result {
                Ok(_) => {
                    info!("discord client stopped cleanly");
                    break;
                }
                Err(e) => {
                    if is_fatal_gateway_error(&e) {
                        error!("discord fatal error (will not retry): {}", e);
                        break;
                    }
                    error!("discord client error: {}", e);
                    warn!("retrying in {:?}", backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    info!("discord client task exiting");
}

/// Discord transport adapter bridging one guild channel
pub struct DiscordAdapter {
    token: String,
    channel_id: u64,
    store: Arc<AttachmentStore>,
    http: Arc<RwLock<Option<Arc<serenity::http::Http>>>>,
    shards: Arc<RwLock<Option<Arc<serenity::gateway::ShardManager>>>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl DiscordAdapter {
    pub fn new(token: String, channel_id: u64, store: Arc<AttachmentStore>) -> Self {
        Self {
            token,
            channel_id,
            store,
            http: Arc::new(RwLock::new(None)),
            shards: Arc::new(RwLock::new(None)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl TransportAdapter for DiscordAdapter {
    async fn initialize(&self) -> Result<(), RelayError> {
        if self.token.is_empty() {
            return Err(RelayError::Configuration(
                "discord bot token is empty".to_string(),
            ));
        }
        if self.channel_id == 0 {
            return Err(RelayError::Configuration(
                "discord channel id not set".to_string(),
            ));
        }
        Ok(())
    }

    async fn start(&self, tx: mpsc::Sender<RelayMessage>) -> Result<(), RelayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("discord adapter already started");
            return Ok(());
        }
        info!("starting discord adapter");

        // Serenity client runs in a background task with retry logic
        tokio::spawn(run_client_loop(
            self.token.clone(),
            ChannelId::new(self.channel_id),
            self.store.clone(),
            tx,
            self.http.clone(),
            self.shards.clone(),
            self.cancel.clone(),
        ));

        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(shards) = self.shards.read().await.as_ref() {
            shards.shutdown_all().await;
        }
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
        let http_guard = self.http.read().await;
        let http = http_guard
            .as_ref()
            .ok_or_else(|| RelayError::Transport("discord adapter not started yet".to_string()))?;

        ChannelId::new(self.channel_id)
            .say(http, msg.render())
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        debug!("forwarded message {} to discord", msg.id);
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Discord
    }
}

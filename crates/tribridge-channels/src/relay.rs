//! Adapter contract and the relay orchestrator that fans messages out
//! across transports

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tribridge_core::{DedupWindow, RelayError, RelayMessage, TransportKind};

/// Capability contract implemented once per transport
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// One-time transport setup (credentials, connection). A configuration
    /// failure keeps this adapter down without affecting the others.
    async fn initialize(&self) -> Result<(), RelayError>;

    /// Begin emitting inbound messages on `tx`. Calling twice is a no-op.
    ///
    /// Adapters must filter out events authored by the relay's own identity
    /// before emitting, so a forwarded message never loops back in.
    async fn start(&self, tx: mpsc::Sender<RelayMessage>) -> Result<(), RelayError>;

    /// Signal every loop this adapter spawned to exit.
    async fn stop(&self);

    /// Deliver a message that originated on another transport. Best-effort,
    /// at most once; the relay logs failures and moves on.
    async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError>;

    /// Which transport this adapter handles
    fn transport(&self) -> TransportKind;
}

/// Owns the adapter set, dedups inbound messages per source, and fans each
/// one out to every transport except its origin.
pub struct Relay {
    adapters: Vec<Arc<dyn TransportAdapter>>,
    incoming_tx: mpsc::Sender<RelayMessage>,
    incoming_rx: mpsc::Receiver<RelayMessage>,
    // one window per source; adapters deliver concurrently from their own
    // tasks, so lookups and inserts happen under this lock
    seen: Mutex<HashMap<TransportKind, DedupWindow>>,
    window_capacity: usize,
}

impl Relay {
    /// Create a relay with the given inbound buffer and per-source dedup
    /// window capacity.
    pub fn new(buffer_size: usize, window_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self {
            adapters: Vec::new(),
            incoming_tx: tx,
            incoming_rx: rx,
            seen: Mutex::new(HashMap::new()),
            window_capacity,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn TransportAdapter>) {
        info!("registering {} adapter", adapter.transport());
        self.adapters.push(adapter);
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    /// Initialize and start every adapter, gateway transport first. A
    /// failing adapter is logged and skipped; the rest keep going.
    pub async fn start_all(&mut self) {
        self.adapters
            .sort_by_key(|a| a.transport().start_priority());

        for adapter in &self.adapters {
            let kind = adapter.transport();
            if let Err(e) = adapter.initialize().await {
                error!("{} adapter failed to initialize: {}", kind, e);
                continue;
            }
            if let Err(e) = adapter.start(self.incoming_tx.clone()).await {
                error!("{} adapter failed to start: {}", kind, e);
                continue;
            }
            info!("{} adapter started", kind);
        }
    }

    /// Route one inbound message. Returns true when it was fanned out,
    /// false when the dedup window dropped it.
    ///
    /// The second emission of an attachment message (same id, localized
    /// URL) lands in the duplicate branch by design.
    pub async fn dispatch(&self, msg: &RelayMessage) -> bool {
        {
            let mut seen = self.seen.lock().await;
            let window = seen
                .entry(msg.source)
                .or_insert_with(|| DedupWindow::new(self.window_capacity));
            if !window.insert(&msg.id) {
                debug!("dropping duplicate {} message {}", msg.source, msg.id);
                return false;
            }
        }

        for adapter in &self.adapters {
            if adapter.transport() == msg.source {
                continue;
            }
            if let Err(e) = adapter.send(msg).await {
                error!(
                    "failed to forward {} message {} to {}: {}",
                    msg.source,
                    msg.id,
                    adapter.transport(),
                    e
                );
            }
        }
        true
    }

    /// Pump inbound messages until cancelled, then stop every adapter.
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("relay shutting down");
                    break;
                }
                msg = self.incoming_rx.recv() => match msg {
                    Some(msg) => {
                        debug!("message {} from {} via {}", msg.id, msg.sender_name, msg.source);
                        self.dispatch(&msg).await;
                    }
                    None => {
                        info!("all adapter streams closed");
                        break;
                    }
                }
            }
        }

        for adapter in &self.adapters {
            adapter.stop().await;
        }
    }

    /// Sender handle for injecting locally-originated messages (startup
    /// announcements, tests).
    pub fn sender(&self) -> mpsc::Sender<RelayMessage> {
        self.incoming_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Mock adapter recording everything it was asked to send
    struct MockAdapter {
        kind: TransportKind,
        sent: Arc<StdMutex<Vec<String>>>,
        fail_send: bool,
        fail_init: bool,
        started: Arc<AtomicBool>,
        start_log: Arc<StdMutex<Vec<TransportKind>>>,
    }

    impl MockAdapter {
        fn new(kind: TransportKind) -> Self {
            Self {
                kind,
                sent: Arc::new(StdMutex::new(Vec::new())),
                fail_send: false,
                fail_init: false,
                started: Arc::new(AtomicBool::new(false)),
                start_log: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn with_start_log(kind: TransportKind, log: Arc<StdMutex<Vec<TransportKind>>>) -> Self {
            let mut mock = Self::new(kind);
            mock.start_log = log;
            mock
        }
    }

    #[async_trait]
    impl TransportAdapter for MockAdapter {
        async fn initialize(&self) -> Result<(), RelayError> {
            if self.fail_init {
                return Err(RelayError::Configuration("token missing".to_string()));
            }
            Ok(())
        }

        async fn start(&self, _tx: mpsc::Sender<RelayMessage>) -> Result<(), RelayError> {
            self.started.store(true, Ordering::SeqCst);
            self.start_log.lock().unwrap().push(self.kind);
            Ok(())
        }

        async fn stop(&self) {}

        async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
            if self.fail_send {
                return Err(RelayError::Transport("send failed".to_string()));
            }
            self.sent.lock().unwrap().push(msg.id.clone());
            Ok(())
        }

        fn transport(&self) -> TransportKind {
            self.kind
        }
    }

    fn msg(id: &str, source: TransportKind) -> RelayMessage {
        RelayMessage::new(id, "alice", "100", "hello", source)
    }

    #[tokio::test]
    async fn test_never_echoes_to_originator() {
        let mut relay = Relay::new(32, 1000);
        let qq = MockAdapter::new(TransportKind::Qq);
        let qq_sent = qq.sent.clone();
        let discord = MockAdapter::new(TransportKind::Discord);
        let discord_sent = discord.sent.clone();
        let telegram = MockAdapter::new(TransportKind::Telegram);
        let telegram_sent = telegram.sent.clone();
        relay.register(Arc::new(qq));
        relay.register(Arc::new(discord));
        relay.register(Arc::new(telegram));

        assert!(relay.dispatch(&msg("100", TransportKind::Qq)).await);

        assert!(qq_sent.lock().unwrap().is_empty());
        assert_eq!(*discord_sent.lock().unwrap(), vec!["100"]);
        assert_eq!(*telegram_sent.lock().unwrap(), vec!["100"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_dropped() {
        let mut relay = Relay::new(32, 1000);
        let discord = MockAdapter::new(TransportKind::Discord);
        let discord_sent = discord.sent.clone();
        relay.register(Arc::new(discord));

        assert!(relay.dispatch(&msg("100", TransportKind::Qq)).await);
        assert!(!relay.dispatch(&msg("100", TransportKind::Qq)).await);
        assert_eq!(discord_sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_id_from_other_source_still_forwards() {
        // ids are unique only within one source's window
        let mut relay = Relay::new(32, 1000);
        let qq = MockAdapter::new(TransportKind::Qq);
        let qq_sent = qq.sent.clone();
        relay.register(Arc::new(qq));

        assert!(relay.dispatch(&msg("100", TransportKind::Discord)).await);
        assert!(relay.dispatch(&msg("100", TransportKind::Telegram)).await);
        assert_eq!(qq_sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_one_failing_target_does_not_block_others() {
        let mut relay = Relay::new(32, 1000);
        let mut discord = MockAdapter::new(TransportKind::Discord);
        discord.fail_send = true;
        let telegram = MockAdapter::new(TransportKind::Telegram);
        let telegram_sent = telegram.sent.clone();
        relay.register(Arc::new(discord));
        relay.register(Arc::new(telegram));

        assert!(relay.dispatch(&msg("1", TransportKind::Qq)).await);
        assert_eq!(*telegram_sent.lock().unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_failed_initialize_does_not_stop_the_rest() {
        let mut relay = Relay::new(32, 1000);
        let mut discord = MockAdapter::new(TransportKind::Discord);
        discord.fail_init = true;
        let discord_started = discord.started.clone();
        let telegram = MockAdapter::new(TransportKind::Telegram);
        let telegram_started = telegram.started.clone();
        relay.register(Arc::new(discord));
        relay.register(Arc::new(telegram));

        relay.start_all().await;

        assert!(!discord_started.load(Ordering::SeqCst));
        assert!(telegram_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_gateway_starts_first() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut relay = Relay::new(32, 1000);
        relay.register(Arc::new(MockAdapter::with_start_log(
            TransportKind::Telegram,
            log.clone(),
        )));
        relay.register(Arc::new(MockAdapter::with_start_log(
            TransportKind::Qq,
            log.clone(),
        )));

        relay.start_all().await;

        assert_eq!(log.lock().unwrap()[0], TransportKind::Qq);
    }

    #[tokio::test]
    async fn test_run_pumps_messages_until_cancelled() {
        let mut relay = Relay::new(32, 1000);
        let discord = MockAdapter::new(TransportKind::Discord);
        let discord_sent = discord.sent.clone();
        relay.register(Arc::new(discord));

        let tx = relay.sender();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            relay.run(run_cancel).await;
        });

        tx.send(msg("7", TransportKind::Qq)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*discord_sent.lock().unwrap(), vec!["7"]);
    }

    #[tokio::test]
    async fn test_window_eviction_applies_per_source() {
        let mut relay = Relay::new(32, 4);
        let discord = MockAdapter::new(TransportKind::Discord);
        let discord_sent = discord.sent.clone();
        relay.register(Arc::new(discord));

        for i in 0..5 {
            relay.dispatch(&msg(&i.to_string(), TransportKind::Qq)).await;
        }
        // "0" was evicted with the oldest half, so it forwards again
        assert!(relay.dispatch(&msg("0", TransportKind::Qq)).await);
        assert_eq!(discord_sent.lock().unwrap().len(), 6);
    }
}

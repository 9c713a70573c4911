//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle with exponential-backoff reconnect
//! - Update and presence send/receive as [`Envelope`]s
//! - Periodic presence resync while connected
//! - Offline queue for updates produced while disconnected
//!
//! The client is transport only: the application feeds received updates
//! into its session and hands outbound updates back to the client.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{Envelope, Frame, ProtocolError, DEFAULT_BINARY_THRESHOLD};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Emitted on every (re)connect. The relay may have restarted or missed
    /// updates, so answer with the session's full state.
    Connected,
    Disconnected,
    /// Waiting `delay` before reconnect attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Replica update relayed from another peer.
    RemoteUpdate(Vec<u8>),
    /// Full document state, answer to the snapshot query sent on connect.
    Snapshot(Vec<u8>),
    /// Encoded presence entries of another peer.
    RemoteEphemeral(Vec<u8>),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub doc_id: Uuid,
    pub reconnect_initial: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,
    pub backoff_multiplier: f64,
    /// How often presence is re-requested while connected.
    pub presence_resync: Duration,
    pub offline_capacity: usize,
    pub binary_threshold: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, doc_id: Uuid) -> Self {
        Self {
            server_url: server_url.into(),
            doc_id,
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            doc_id: Uuid::nil(),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            presence_resync: Duration::from_secs(10),
            offline_capacity: 10_000,
            binary_threshold: DEFAULT_BINARY_THRESHOLD,
        }
    }
}

/// Exponential reconnect delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            attempt: 0,
            current: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.reconnect_initial,
            config.reconnect_max,
            config.backoff_multiplier,
        )
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempt == 0 {
            self.initial
        } else {
            Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
                .unwrap_or(self.max)
                .min(self.max)
        };
        self.attempt = self.attempt.saturating_add(1);
        self.current = delay;
        delay
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = Duration::ZERO;
    }
}

/// Updates produced while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns `false` when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// State shared between the client handle and its connection task.
struct Shared {
    state: RwLock<ConnectionState>,
    offline_queue: Mutex<OfflineQueue>,
    events: mpsc::Sender<SyncEvent>,
}

impl Shared {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event).await;
    }
}

enum Outcome {
    Lost,
    Shutdown,
}

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    outgoing_tx: Option<mpsc::Sender<Envelope>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                offline_queue: Mutex::new(OfflineQueue::new(config.offline_capacity)),
                events,
            }),
            config,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            shutdown_tx,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    fn url(&self) -> String {
        format!("{}/{}", self.config.server_url, self.config.doc_id)
    }

    /// Connect to the relay.
    ///
    /// The first attempt is made inline and its failure is returned. Once
    /// connected, a background task keeps the connection alive and
    /// reconnects with backoff until [`disconnect`](Self::disconnect).
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.supervisor.is_some() {
            return Ok(());
        }
        self.shared.set_state(ConnectionState::Connecting).await;

        let url = self.url();
        let ws = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("Cannot connect to {url}: {e}");
                self.shared.set_state(ConnectionState::Disconnected).await;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (out_tx, out_rx) = mpsc::channel(256);
        self.outgoing_tx = Some(out_tx);
        self.shutdown_tx.send_replace(false);
        let shutdown = self.shutdown_tx.subscribe();
        self.shared.set_state(ConnectionState::Connected).await;

        self.supervisor = Some(tokio::spawn(supervise(
            ws,
            url,
            self.config.clone(),
            self.shared.clone(),
            out_rx,
            shutdown,
        )));
        Ok(())
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn disconnect(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                log::error!("Connection task failed: {e}");
            }
        }
        self.outgoing_tx = None;
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Send a replica update. Queued for replay while disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let envelope = Envelope::update(self.config.doc_id, update);
        let envelope = match (&self.outgoing_tx, self.connection_state().await) {
            (Some(tx), ConnectionState::Connected) => match tx.send(envelope).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            _ => envelope,
        };
        let Envelope::Update { update, .. } = envelope else {
            return Err(ProtocolError::InvalidMessageType);
        };
        if self.shared.offline_queue.lock().await.enqueue(update) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Send encoded presence. Dropped while offline; the resync after
    /// reconnect refreshes it.
    pub async fn send_ephemeral(&self, ephemeral: Vec<u8>) -> Result<(), ProtocolError> {
        self.send_control(Envelope::ephemeral(self.config.doc_id, ephemeral))
            .await
    }

    pub async fn request_snapshot(&self) -> Result<(), ProtocolError> {
        self.send_control(Envelope::QuerySnapshot {
            doc_id: self.config.doc_id,
        })
        .await
    }

    async fn send_control(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        if let Some(tx) = &self.outgoing_tx {
            tx.send(envelope)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn doc_id(&self) -> Uuid {
        self.config.doc_id
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.offline_queue.lock().await.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Connection task
// ───────────────────────────────────────────────────────────────────

async fn supervise(
    mut ws: WsStream,
    url: String,
    config: ClientConfig,
    shared: Arc<Shared>,
    mut out_rx: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::from_config(&config);
    'session: loop {
        match run_connection(ws, &config, &shared, &mut out_rx, &mut shutdown).await {
            Outcome::Shutdown => break,
            Outcome::Lost => {
                log::info!("Connection to {url} lost");
                shared.emit(SyncEvent::Disconnected).await;
            }
        }

        ws = loop {
            let delay = backoff.next_delay();
            shared.set_state(ConnectionState::Reconnecting).await;
            shared
                .emit(SyncEvent::Reconnecting {
                    attempt: backoff.attempt(),
                    delay,
                })
                .await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break 'session,
            }
            let attempt = tokio::select! {
                result = tokio_tungstenite::connect_async(&url) => result,
                _ = shutdown.changed() => break 'session,
            };
            match attempt {
                Ok((ws, _)) => {
                    log::info!("Reconnected to {url} after {} attempts", backoff.attempt());
                    backoff.reset();
                    break ws;
                }
                Err(e) => log::debug!("Reconnect attempt {} failed: {e}", backoff.attempt()),
            }
        };
    }
    shared.set_state(ConnectionState::Disconnected).await;
    shared.emit(SyncEvent::Disconnected).await;
}

async fn send_envelope(
    writer: &mut WsWriter,
    envelope: &Envelope,
    binary_threshold: usize,
) -> Result<(), ProtocolError> {
    let frame = envelope.encode(binary_threshold)?;
    writer
        .send(frame.into_message())
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

async fn run_connection(
    ws: WsStream,
    config: &ClientConfig,
    shared: &Shared,
    out_rx: &mut mpsc::Receiver<Envelope>,
    shutdown: &mut watch::Receiver<bool>,
) -> Outcome {
    if *shutdown.borrow_and_update() {
        return Outcome::Shutdown;
    }
    let (mut writer, mut reader) = ws.split();
    let doc_id = config.doc_id;
    shared.set_state(ConnectionState::Connected).await;
    shared.emit(SyncEvent::Connected).await;

    let queued = shared.offline_queue.lock().await.drain();
    if !queued.is_empty() {
        log::info!("Replaying {} queued updates", queued.len());
    }
    let mut opening = vec![
        Envelope::QuerySnapshot { doc_id },
        Envelope::QueryEphemeral { doc_id },
    ];
    opening.extend(queued.into_iter().map(|u| Envelope::update(doc_id, u)));
    for envelope in &opening {
        if send_envelope(&mut writer, envelope, config.binary_threshold)
            .await
            .is_err()
        {
            requeue(shared, opening).await;
            return Outcome::Lost;
        }
    }

    let period = config.presence_resync;
    let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return Outcome::Shutdown;
            }

            out = out_rx.recv() => {
                let Some(envelope) = out else {
                    return Outcome::Shutdown;
                };
                if send_envelope(&mut writer, &envelope, config.binary_threshold).await.is_err() {
                    requeue(shared, vec![envelope]).await;
                    return Outcome::Lost;
                }
            }

            msg = reader.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => Frame::Binary(data.to_vec()),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Outcome::Lost,
                    Some(Ok(_)) => continue,
                };
                let envelope = match frame.decode() {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        log::warn!("Dropping undecodable frame: {e}");
                        continue;
                    }
                };
                if envelope.doc_id().is_some_and(|id| id != doc_id) {
                    log::debug!("Ignoring message for another document");
                    continue;
                }
                let event = match envelope {
                    Envelope::Update { update, .. } => Some(SyncEvent::RemoteUpdate(update)),
                    Envelope::Snapshot { snapshot, .. } => Some(SyncEvent::Snapshot(snapshot)),
                    Envelope::Ephemeral { ephemeral, .. } => Some(SyncEvent::RemoteEphemeral(ephemeral)),
                    Envelope::Ping => {
                        if send_envelope(&mut writer, &Envelope::Pong, config.binary_threshold).await.is_err() {
                            return Outcome::Lost;
                        }
                        None
                    }
                    Envelope::Pong | Envelope::QuerySnapshot { .. } | Envelope::QueryEphemeral { .. } => None,
                };
                if let Some(event) = event {
                    shared.emit(event).await;
                }
            }

            _ = resync.tick() => {
                let query = Envelope::QueryEphemeral { doc_id };
                if send_envelope(&mut writer, &query, config.binary_threshold).await.is_err() {
                    return Outcome::Lost;
                }
            }
        }
    }
}

/// Put unsent updates back for the next connection.
async fn requeue(shared: &Shared, envelopes: Vec<Envelope>) {
    let mut queue = shared.offline_queue.lock().await;
    for envelope in envelopes {
        if let Envelope::Update { update, .. } = envelope {
            if !queue.enqueue(update) {
                log::error!("Offline queue full, dropping update");
            }
        }
    }
}

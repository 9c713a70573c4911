//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── LoroDoc ── BroadcastGroup
//! Client B ──┘                        │
//!                                     ├── ephemeral cache (per connection, TTL)
//!                                     │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! A connection joins the room named by the `docId` of its first message.
//! Each room keeps an authoritative replica so that late joiners can be
//! answered with a snapshot, plus the latest presence payload of every
//! connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use loro::{ExportMode, LoroDoc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomMessage};
use crate::protocol::{Envelope, Frame, DEFAULT_BINARY_THRESHOLD};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Connections beyond this are refused.
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Cached presence older than this is not served.
    pub presence_ttl: Duration,
    pub binary_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            presence_ttl: Duration::from_secs(30),
            binary_threshold: DEFAULT_BINARY_THRESHOLD,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_updates: u64,
}

struct EphemeralEntry {
    payload: Vec<u8>,
    updated: Instant,
}

/// Document room: replica + broadcast group + presence cache.
struct DocumentRoom {
    doc: LoroDoc,
    broadcast: Arc<BroadcastGroup>,
    ephemeral: HashMap<Uuid, EphemeralEntry>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: LoroDoc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            ephemeral: HashMap::new(),
        }
    }

    /// Presence payloads of everyone but `except` that are still fresh.
    fn fresh_ephemeral(&self, except: Uuid, ttl: Duration, now: Instant) -> Vec<Vec<u8>> {
        self.ephemeral
            .iter()
            .filter(|(conn, entry)| {
                **conn != except && now.saturating_duration_since(entry.updated) < ttl
            })
            .map(|(_, entry)| entry.payload.clone())
            .collect()
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, DocumentRoom>>>;

/// Per-connection state.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    doc_id: Option<Uuid>,
    rx: Option<broadcast::Receiver<Arc<RoomMessage>>>,
}

/// What to do after handling one inbound message.
enum Reply {
    None,
    Send(Vec<Envelope>),
    Close,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            id: Uuid::new_v4(),
            addr,
            doc_id: None,
            rx: None,
        };
        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let frame = match msg {
                            Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                            Some(Ok(Message::Binary(data))) => Frame::Binary(data.to_vec()),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += frame.len() as u64;
                        }
                        let envelope = match frame.decode() {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        match Self::handle_envelope(&mut conn, envelope, frame, &rooms, &stats, &config).await {
                            Reply::None => {}
                            Reply::Send(replies) => {
                                for reply in replies {
                                    ws_sender.send(reply.encode(config.binary_threshold)?.into_message()).await?;
                                }
                            }
                            Reply::Close => {
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                        }
                    }

                    msg = async {
                        match conn.rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(relayed) => {
                                if relayed.sender != conn.id {
                                    ws_sender.send(relayed.frame.clone().into_message()).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {} lagged by {n} messages", conn.id);
                                if let Some(did) = conn.doc_id {
                                    if let Some(room) = rooms.read().await.get(&did) {
                                        room.broadcast.record_dropped(n);
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        Self::leave(&conn, &rooms, &stats).await;
        result
    }

    async fn handle_envelope(
        conn: &mut Connection,
        envelope: Envelope,
        frame: Frame,
        rooms: &Rooms,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> Reply {
        let doc_id = match envelope.doc_id() {
            Some(doc_id) => doc_id,
            None => {
                return match envelope {
                    Envelope::Ping => Reply::Send(vec![Envelope::Pong]),
                    _ => Reply::None,
                };
            }
        };

        match conn.doc_id {
            Some(joined) if joined != doc_id => {
                log::warn!(
                    "Connection {} sent a message for doc {doc_id} while in {joined}",
                    conn.id
                );
                return Reply::None;
            }
            Some(_) => {}
            None => {
                if !Self::join(conn, doc_id, rooms, stats, config).await {
                    return Reply::Close;
                }
            }
        }

        let mut rooms_w = rooms.write().await;
        let Some(room) = rooms_w.get_mut(&doc_id) else {
            return Reply::None;
        };

        match envelope {
            Envelope::Update { update, .. } => {
                if let Err(e) = room.doc.import(&update) {
                    log::warn!("Rejected update for doc {doc_id} from {}: {e}", conn.addr);
                    drop(rooms_w);
                    stats.write().await.rejected_updates += 1;
                    return Reply::None;
                }
                room.broadcast.broadcast(conn.id, frame);
                Reply::None
            }
            Envelope::QuerySnapshot { .. } => match room.doc.export(ExportMode::Snapshot) {
                Ok(snapshot) => Reply::Send(vec![Envelope::Snapshot { doc_id, snapshot }]),
                Err(e) => {
                    log::error!("Cannot export snapshot of doc {doc_id}: {e}");
                    Reply::None
                }
            },
            Envelope::Ephemeral { ephemeral, .. } => {
                room.ephemeral.insert(
                    conn.id,
                    EphemeralEntry {
                        payload: ephemeral,
                        updated: Instant::now(),
                    },
                );
                log::trace!("Presence update in room {doc_id}");
                room.broadcast.broadcast(conn.id, frame);
                Reply::None
            }
            Envelope::QueryEphemeral { .. } => {
                let entries = room.fresh_ephemeral(conn.id, config.presence_ttl, Instant::now());
                Reply::Send(
                    entries
                        .into_iter()
                        .map(|payload| Envelope::ephemeral(doc_id, payload))
                        .collect(),
                )
            }
            Envelope::Snapshot { .. } => {
                log::debug!("Ignoring snapshot pushed by {}", conn.addr);
                Reply::None
            }
            Envelope::Ping | Envelope::Pong => Reply::None,
        }
    }

    /// Attach `conn` to the room for `doc_id`. Returns `false` when the room is full.
    async fn join(
        conn: &mut Connection,
        doc_id: Uuid,
        rooms: &Rooms,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> bool {
        let (broadcast, room_count) = {
            let mut rooms_w = rooms.write().await;
            let room = rooms_w
                .entry(doc_id)
                .or_insert_with(|| DocumentRoom::new(config.broadcast_capacity));
            (room.broadcast.clone(), rooms_w.len())
        };
        if broadcast.peer_count().await >= config.max_peers_per_room {
            log::warn!("Room {doc_id} is full, refusing {}", conn.addr);
            return false;
        }
        conn.rx = Some(broadcast.add_peer(conn.id, conn.addr).await);
        conn.doc_id = Some(doc_id);
        stats.write().await.active_rooms = room_count;
        log::info!("Connection {} ({}) joined doc {doc_id}", conn.id, conn.addr);
        true
    }

    async fn leave(conn: &Connection, rooms: &Rooms, stats: &Arc<RwLock<ServerStats>>) {
        if let Some(did) = conn.doc_id {
            let broadcast = {
                let mut rooms_w = rooms.write().await;
                rooms_w.get_mut(&did).map(|room| {
                    room.ephemeral.remove(&conn.id);
                    room.broadcast.clone()
                })
            };
            if let Some(broadcast) = broadcast {
                broadcast.remove_peer(&conn.id).await;
            }
            Self::idle_if_empty(did, rooms).await;
        }

        let room_count = rooms.read().await.len();
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = room_count;
    }

    /// A room whose last peer left keeps its replica for the next joiner;
    /// only the presence cache is cleared.
    async fn idle_if_empty(doc_id: Uuid, rooms: &Rooms) {
        let mut rooms_w = rooms.write().await;
        if let Some(room) = rooms_w.get_mut(&doc_id) {
            if room.broadcast.peer_count().await == 0 && !room.ephemeral.is_empty() {
                room.ephemeral.clear();
                log::info!("Room {doc_id} is idle, presence cache cleared");
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.presence_ttl, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.rejected_updates, 0);
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_document_room_creation() {
        let room = DocumentRoom::new(64);
        assert_eq!(room.broadcast.peer_count().await, 0);
        assert_eq!(room.broadcast.capacity(), 64);
    }

    #[test]
    fn test_fresh_ephemeral_skips_self_and_stale() {
        let mut room = DocumentRoom::new(4);
        let (me, fresh, stale) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = Instant::now();
        let ttl = Duration::from_secs(30);
        room.ephemeral.insert(me, EphemeralEntry { payload: vec![0], updated: now });
        room.ephemeral.insert(fresh, EphemeralEntry { payload: vec![1], updated: now });
        room.ephemeral.insert(stale, EphemeralEntry { payload: vec![2], updated: now });

        let later = now + Duration::from_secs(10);
        room.ephemeral.get_mut(&fresh).unwrap().updated = later;
        let entries = room.fresh_ephemeral(me, ttl, later + Duration::from_secs(25));
        assert_eq!(entries, vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_update_is_imported_into_room() {
        let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let config = ServerConfig::default();
        let doc_id = Uuid::new_v4();
        let mut conn = Connection {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:1".parse().unwrap(),
            doc_id: None,
            rx: None,
        };

        let source = LoroDoc::new();
        source.get_text("t").insert(0, "hello").unwrap();
        source.commit();
        let update = source.export(ExportMode::all_updates()).unwrap();

        let envelope = Envelope::update(doc_id, update);
        let frame = envelope.encode(config.binary_threshold).unwrap();
        let reply =
            SyncServer::handle_envelope(&mut conn, envelope, frame, &rooms, &stats, &config).await;
        assert!(matches!(reply, Reply::None));
        assert_eq!(conn.doc_id, Some(doc_id));

        let rooms_r = rooms.read().await;
        let text = rooms_r[&doc_id].doc.get_text("t").to_string();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_corrupt_update_is_rejected() {
        let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let config = ServerConfig::default();
        let mut conn = Connection {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:1".parse().unwrap(),
            doc_id: None,
            rx: None,
        };
        let envelope = Envelope::update(Uuid::new_v4(), b"garbage".to_vec());
        let frame = envelope.encode(config.binary_threshold).unwrap();
        SyncServer::handle_envelope(&mut conn, envelope, frame, &rooms, &stats, &config).await;
        assert_eq!(stats.read().await.rejected_updates, 1);
    }

    #[tokio::test]
    async fn test_full_room_refuses_connection() {
        let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let config = ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::default()
        };
        let doc_id = Uuid::new_v4();
        let mut conns: Vec<Connection> = (0..2)
            .map(|_| Connection {
                id: Uuid::new_v4(),
                addr: "127.0.0.1:1".parse().unwrap(),
                doc_id: None,
                rx: None,
            })
            .collect();

        assert!(SyncServer::join(&mut conns[0], doc_id, &rooms, &stats, &config).await);
        assert!(!SyncServer::join(&mut conns[1], doc_id, &rooms, &stats, &config).await);
        assert!(conns[1].doc_id.is_none());

        SyncServer::leave(&conns[0], &rooms, &stats).await;
        assert_eq!(rooms.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_room_keeps_document_after_last_peer_leaves() {
        let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let config = ServerConfig::default();
        let doc_id = Uuid::new_v4();
        let mut conn = Connection {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:1".parse().unwrap(),
            doc_id: None,
            rx: None,
        };

        let source = LoroDoc::new();
        source.get_text("t").insert(0, "kept").unwrap();
        source.commit();
        let envelope = Envelope::update(doc_id, source.export(ExportMode::all_updates()).unwrap());
        let frame = envelope.encode(config.binary_threshold).unwrap();
        SyncServer::handle_envelope(&mut conn, envelope, frame, &rooms, &stats, &config).await;

        let presence = Envelope::ephemeral(doc_id, vec![1, 2, 3]);
        let frame = presence.encode(config.binary_threshold).unwrap();
        SyncServer::handle_envelope(&mut conn, presence, frame, &rooms, &stats, &config).await;
        SyncServer::leave(&conn, &rooms, &stats).await;

        let rooms_r = rooms.read().await;
        let room = &rooms_r[&doc_id];
        assert_eq!(room.doc.get_text("t").to_string(), "kept");
        assert!(room.ephemeral.is_empty());
        assert_eq!(room.broadcast.peer_count().await, 0);
    }
}

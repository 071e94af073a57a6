use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock as SyncRwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    spawn_periodic, BroadcastRelay, CancellationToken, ConnectionKind, Envelope, InboundMessage,
    MessageKind, NoopRelay, OutboundMessage, SwitchyardResult,
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A frame queued for delivery to one connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A serialized envelope.
    Text(String),
    /// Transport-level liveness ping.
    Ping,
    /// Close the socket.
    Close,
}

/// Everything the transport knows about a connection at handshake time.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Request path the peer connected to; determines the kind.
    pub path: String,
    /// Declared name, if the peer supplied one.
    pub name: Option<String>,
    /// Free-form metadata from the handshake.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Writer side of the socket.
    pub tx: mpsc::UnboundedSender<OutboundFrame>,
}

/// A live duplex connection. Owned exclusively by the [`ConnectionRegistry`].
#[derive(Debug)]
struct Connection {
    id: Uuid,
    name: String,
    kind: ConnectionKind,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    metadata: HashMap<String, serde_json::Value>,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn deliver(&self, frame: OutboundFrame) -> bool {
        self.is_open() && self.tx.send(frame).is_ok()
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            connected_at: self.connected_at,
            last_activity: self.last_activity_at,
            metadata: self.metadata.clone(),
            open: self.is_open(),
        }
    }
}

/// Read-only view of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Registry-assigned id.
    pub id: Uuid,
    /// Declared name.
    pub name: String,
    /// Classified kind.
    pub kind: ConnectionKind,
    /// Handshake time.
    pub connected_at: DateTime<Utc>,
    /// Last inbound frame.
    pub last_activity: DateTime<Utc>,
    /// Handshake metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Whether the socket writer is still attached.
    pub open: bool,
}

/// Lifecycle notifications for in-process subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection completed its handshake.
    Connected {
        /// Connection id.
        id: Uuid,
        /// Its kind.
        kind: ConnectionKind,
    },
    /// A connection closed or was terminated for inactivity.
    Disconnected {
        /// Connection id.
        id: Uuid,
        /// Its kind.
        kind: ConnectionKind,
    },
}

/// Handles one inbound message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a decoded message from `connection_id`.
    async fn handle(&self, connection_id: Uuid, message: InboundMessage) -> SwitchyardResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Uuid, InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = SwitchyardResult<()>> + Send,
{
    async fn handle(&self, connection_id: Uuid, message: InboundMessage) -> SwitchyardResult<()> {
        (self.0)(connection_id, message).await
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Uuid, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwitchyardResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Liveness tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Seconds between liveness sweeps.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence after which a connection is terminated.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_liveness_timeout_secs() -> u64 {
    90
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
        }
    }
}

impl RegistryConfig {
    /// Interval between sweeps.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Inactivity limit.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

/// Owns every live connection and the dispatch table for inbound messages.
///
/// All access to connections goes through this type; other components hold
/// an `Arc<ConnectionRegistry>` and never see a socket. The connection table
/// sits behind one async `RwLock`, the handler table behind a sync lock that
/// is never held across an await.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Connection>>,
    handlers: SyncRwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>,
    events: broadcast::Sender<ConnectionEvent>,
    relay: Arc<dyn BroadcastRelay>,
    config: RegistryConfig,
    last_sweep: Mutex<Option<Instant>>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionRegistry {
    /// Creates a registry that does not relay broadcasts across instances.
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Self::with_relay(config, Arc::new(NoopRelay))
    }

    /// Creates a registry that hands every full broadcast to `relay`.
    pub fn with_relay(config: RegistryConfig, relay: Arc<dyn BroadcastRelay>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            handlers: SyncRwLock::new(HashMap::new()),
            events,
            relay,
            config,
            last_sweep: Mutex::new(None),
            sweeper: Mutex::new(None),
        })
    }

    /// Liveness tunables in effect.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Registers a new connection and announces it.
    pub async fn register(&self, handle: ConnectionHandle) -> Uuid {
        let id = Uuid::new_v4();
        let kind = ConnectionKind::from_path(&handle.path);
        let name = handle
            .name
            .unwrap_or_else(|| format!("{kind}-{}", &id.simple().to_string()[..8]));
        let now = Utc::now();
        let conn = Connection {
            id,
            name: name.clone(),
            kind,
            connected_at: now,
            last_activity: Instant::now(),
            last_activity_at: now,
            metadata: handle.metadata,
            tx: handle.tx,
        };
        self.connections.write().await.insert(id, conn);
        info!(connection_id = %id, kind = %kind, name = %name, "Connection registered");

        self.send(
            id,
            &OutboundMessage::Welcome {
                connection_id: id,
                kind,
            },
        )
        .await;
        self.broadcast_all(&OutboundMessage::ConnectionNotice {
            connection_id: id,
            kind,
            online: true,
        })
        .await;
        let _ = self.events.send(ConnectionEvent::Connected { id, kind });
        id
    }

    /// Removes a connection whose transport has closed.
    pub async fn unregister(&self, id: Uuid) {
        let removed = self.connections.write().await.remove(&id);
        if let Some(conn) = removed {
            info!(connection_id = %id, kind = %conn.kind, "Connection removed");
            self.announce_offline(id, conn.kind).await;
        }
    }

    async fn announce_offline(&self, id: Uuid, kind: ConnectionKind) {
        self.broadcast_all(&OutboundMessage::ConnectionNotice {
            connection_id: id,
            kind,
            online: false,
        })
        .await;
        let _ = self.events.send(ConnectionEvent::Disconnected { id, kind });
    }

    /// Records activity on a connection.
    pub async fn touch(&self, id: Uuid) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.last_activity = Instant::now();
            conn.last_activity_at = Utc::now();
        }
    }

    /// Delivers a message to one connection. Best-effort: returns `false`
    /// and logs when the connection is absent or closed.
    pub async fn send(&self, id: Uuid, message: &OutboundMessage) -> bool {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!(connection_id = %id, error = %e, "Failed to serialize outbound message");
                return false;
            }
        };
        let conns = self.connections.read().await;
        match conns.get(&id) {
            Some(conn) if conn.deliver(OutboundFrame::Text(frame)) => true,
            Some(_) => {
                warn!(
                    connection_id = %id,
                    msg_type = %message.message_type(),
                    "Send to closed connection dropped",
                );
                false
            }
            None => {
                warn!(
                    connection_id = %id,
                    msg_type = %message.message_type(),
                    "Send to unknown connection dropped",
                );
                false
            }
        }
    }

    /// Sends to every open connection. Returns the number reached.
    pub async fn broadcast_all(&self, message: &OutboundMessage) -> usize {
        let Some(frame) = serialize(message) else {
            return 0;
        };
        if let Err(e) = self.relay.publish(&frame).await {
            warn!(error = %e, "Broadcast relay publish failed");
        }
        self.fan_out(&frame, |_| true).await
    }

    /// Sends to every open connection of one kind.
    pub async fn broadcast_by_kind(
        &self,
        kind: ConnectionKind,
        message: &OutboundMessage,
    ) -> usize {
        let Some(frame) = serialize(message) else {
            return 0;
        };
        self.fan_out(&frame, |c| c.kind == kind).await
    }

    /// Sends to an explicit set of connections, skipping closed or unknown ids.
    pub async fn broadcast_to(&self, ids: &[Uuid], message: &OutboundMessage) -> usize {
        let Some(frame) = serialize(message) else {
            return 0;
        };
        self.fan_out(&frame, |c| ids.contains(&c.id)).await
    }

    async fn fan_out(&self, frame: &str, filter: impl Fn(&Connection) -> bool) -> usize {
        let conns = self.connections.read().await;
        conns
            .values()
            .filter(|c| filter(c))
            .filter(|c| c.deliver(OutboundFrame::Text(frame.to_string())))
            .count()
    }

    /// Installs the handler for one message type, replacing any previous one.
    pub fn on_message(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        if self.handlers.write().insert(kind, handler).is_some() {
            debug!(msg_type = %kind, "Replaced message handler");
        }
    }

    /// Removes the handler for one message type.
    pub fn off_message(&self, kind: MessageKind) {
        self.handlers.write().remove(&kind);
    }

    /// Returns `true` if a handler is installed for `kind`.
    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Processes one inbound text frame from `id`.
    ///
    /// Unparseable frames, unknown types and malformed payloads are logged
    /// and dropped. A failing or panicking handler only affects this message.
    pub async fn handle_inbound(&self, id: Uuid, text: &str) {
        self.touch(id).await;

        let envelope = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Dropping unparseable frame");
                return;
            }
        };
        let message = match InboundMessage::decode(&envelope) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(
                    connection_id = %id,
                    msg_type = %envelope.msg_type,
                    "No dispatch for message type",
                );
                return;
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Dropping malformed message");
                return;
            }
        };

        if message == InboundMessage::Ping {
            self.send(id, &OutboundMessage::Pong).await;
        }

        let kind = message.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            if kind != MessageKind::Ping {
                debug!(connection_id = %id, msg_type = %kind, "No handler registered");
            }
            return;
        };

        match tokio::spawn(async move { handler.handle(id, message).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                connection_id = %id,
                msg_type = %kind,
                error = %e,
                "Message handler failed",
            ),
            Err(e) => error!(
                connection_id = %id,
                msg_type = %kind,
                error = %e,
                "Message handler panicked",
            ),
        }
    }

    /// Pings every connection and terminates those silent past the liveness
    /// timeout or whose writer has gone away. Returns the terminated ids.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let timeout = self.config.liveness_timeout();
        let mut dead = Vec::new();
        {
            let mut conns = self.connections.write().await;
            conns.retain(|id, conn| {
                let silent = now.saturating_duration_since(conn.last_activity);
                if silent > timeout || !conn.is_open() {
                    warn!(
                        connection_id = %id,
                        silent_secs = silent.as_secs(),
                        "Terminating inactive connection",
                    );
                    let _ = conn.tx.send(OutboundFrame::Close);
                    dead.push((*id, conn.kind));
                    false
                } else {
                    let _ = conn.tx.send(OutboundFrame::Ping);
                    true
                }
            });
        }
        *self.last_sweep.lock() = Some(now);

        for (id, kind) in &dead {
            self.announce_offline(*id, *kind).await;
        }
        dead.into_iter().map(|(id, _)| id).collect()
    }

    /// Starts the periodic liveness sweep.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let registry = Arc::clone(self);
        let token = shutdown.clone();
        let handle = spawn_periodic(
            "registry-sweep",
            self.config.heartbeat_interval(),
            shutdown,
            move || {
                let registry = Arc::clone(&registry);
                async move {
                    registry.sweep().await;
                }
            },
        );
        if let Some((_, old)) = self.sweeper.lock().replace((token, handle)) {
            old.abort();
        }
    }

    /// Returns `true` while the sweep loop is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|(_, h)| !h.is_finished())
    }

    /// Time of the last completed sweep.
    pub fn last_sweep(&self) -> Option<Instant> {
        *self.last_sweep.lock()
    }

    /// Restarts a dead sweep loop and runs a sweep immediately.
    pub async fn reinitialize(self: &Arc<Self>) -> SwitchyardResult<()> {
        let token = self.sweeper.lock().as_ref().map(|(t, _)| t.clone());
        if let Some(token) = token {
            if !self.is_sweeping() && !token.is_cancelled() {
                info!("Restarting registry sweep loop");
                self.start(token);
            }
        }
        let terminated = self.sweep().await;
        info!(terminated = terminated.len(), "Registry reinitialized");
        Ok(())
    }

    /// Snapshot of one connection.
    pub async fn get(&self, id: Uuid) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&id).map(Connection::info)
    }

    /// Snapshot of every connection.
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self
            .connections
            .read()
            .await
            .values()
            .map(Connection::info)
            .collect();
        all.sort_by_key(|c| c.connected_at);
        all
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of registered connections of one kind.
    pub async fn count_by_kind(&self, kind: ConnectionKind) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.kind == kind)
            .count()
    }
}

fn serialize(message: &OutboundMessage) -> Option<String> {
    match message.to_json() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(msg_type = %message.message_type(), error = %e, "Failed to serialize broadcast");
            None
        }
    }
}

//! WebSocket front end of the sync server.
//!
//! ```text
//! Client A ──┐                          ┌─► Map room 7 ──► Client B
//!             ├── SyncServer ── Hub ─────┼─► Tenant room ─► Client C
//! Client B ──┘                  │       └─► Global ──────► everyone
//!                               └── DocumentStore (RocksDB, optional)
//! ```
//!
//! One task per connection. A connection starts with `Hello`, is answered
//! with `Welcome`, and from then on multiplexes requests from the socket
//! with frames (replies and pushes) from the session's outbox.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use atelier_core::SyncError;

use crate::broadcast::{Frame, SessionId};
use crate::hub::{Hub, ServerStats};
use crate::protocol::{Hello, MessageType, ProtocolError, SyncMessage};
use crate::session::{Authenticator, TokenParseError, TokenTable};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions with the same map open
    pub max_sessions_per_map: usize,
    /// Frames buffered per session before it is cut off
    pub outbox_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Snapshot and unload maps nobody has open (needs storage)
    pub evict_idle_maps: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_map: 100,
            outbox_capacity: 1024,
            heartbeat_interval_secs: 30,
            storage_path: None,
            evict_idle_maps: true,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("ATELIER_TOKENS: {0}")]
    Tokens(#[from] TokenParseError),
}

impl ServerConfig {
    /// Defaults overridden by `ATELIER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("ATELIER_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("ATELIER_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parsed(&lookup, "ATELIER_MAX_SESSIONS_PER_MAP")? {
            config.max_sessions_per_map = v;
        }
        if let Some(v) = parsed::<_, usize>(&lookup, "ATELIER_OUTBOX_CAPACITY")? {
            if v == 0 {
                return Err(ConfigError::Invalid {
                    var: "ATELIER_OUTBOX_CAPACITY",
                    value: v.to_string(),
                    reason: "must be positive".into(),
                });
            }
            config.outbox_capacity = v;
        }
        if let Some(v) = parsed(&lookup, "ATELIER_HEARTBEAT_SECS")? {
            config.heartbeat_interval_secs = v;
        }
        if let Some(v) = parsed(&lookup, "ATELIER_EVICT_IDLE_MAPS")? {
            config.evict_idle_maps = v;
        }
        Ok(config)
    }

    /// Token table from `ATELIER_TOKENS` (empty when unset).
    pub fn tokens_from_env() -> Result<TokenTable, ConfigError> {
        Ok(TokenTable::parse(&std::env::var("ATELIER_TOKENS").unwrap_or_default())?)
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

/// Server startup or accept-loop failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Failure of a single connection.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("expected Hello as first message")]
    ExpectedHello,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Hub>,
}

impl SyncServer {
    /// Create the server, opening and recovering storage if configured.
    pub fn new(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Result<Self, ServerError> {
        let hub = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(DocumentStore::open(StoreConfig::new(path))?);
                Hub::with_storage(config.clone(), authenticator, store)?
            }
            None => Hub::new(config.clone(), authenticator),
        };
        Ok(Self {
            config,
            hub: Arc::new(hub),
        })
    }

    /// In-memory server with default configuration and no tokens.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        Self {
            hub: Arc::new(Hub::new(config.clone(), Arc::new(TokenTable::new()))),
            config,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.stats().await
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` fires, then flush
    /// every live document to storage.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
        log::info!("sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            log::debug!("new TCP connection from {addr}");

            let hub = self.hub.clone();
            let config = self.config.clone();
            let shutdown = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, config, shutdown).await {
                    log::warn!("connection error from {addr}: {e}");
                }
            });
        }

        log::info!("sync server shutting down");
        self.hub.flush().await?;
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => SyncMessage::decode(&data)?.hello_body()?,
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Ok(()),
        Ok(Some(Ok(_))) | Err(_) => return Err(ConnectionError::ExpectedHello),
    };

    let (tx, outbox) = mpsc::channel(config.outbox_capacity);
    let welcome = hub.connect(&hello, tx).await;
    let session = welcome.session_id;
    log::info!("websocket session {session} established from {addr}");

    let result = async {
        send(&mut ws_sender, &SyncMessage::welcome(&welcome)?).await?;
        pump(&hub, session, &config, &mut ws_sender, &mut ws_receiver, outbox, &shutdown).await
    }
    .await;

    hub.disconnect(session).await;
    let _ = ws_sender.close().await;
    result
}

/// Shuttle frames until either side closes.
async fn pump(
    hub: &Hub,
    session: SessionId,
    config: &ServerConfig,
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    mut outbox: mpsc::Receiver<Frame>,
    shutdown: &CancellationToken,
) -> Result<(), ConnectionError> {
    let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                    Ok(msg) => {
                        if let Some(response) = handle_message(hub, session, msg).await {
                            send(ws_sender, &response).await?;
                        }
                    }
                    Err(e) => log::warn!("session {session}: undecodable frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            frame = outbox.recv() => match frame {
                Some(bytes) => ws_sender.send(Message::Binary(bytes.to_vec().into())).await?,
                None => {
                    log::warn!("session {session} was cut off, closing");
                    return Ok(());
                }
            },
            _ = heartbeat.tick() => send(ws_sender, &SyncMessage::ping(session)).await?,
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

/// Route one client message. Returns a frame to send back directly.
async fn handle_message(hub: &Hub, session: SessionId, msg: SyncMessage) -> Option<SyncMessage> {
    match msg.msg_type {
        MessageType::Request => {
            match msg.request_body() {
                Ok(request) => hub.handle_and_reply(session, msg.request_id, request).await,
                Err(e) => {
                    hub.reject(session, msg.request_id, SyncError::validation(e.to_string()))
                        .await
                }
            }
            None
        }
        MessageType::JoinRoom | MessageType::LeaveRoom => {
            let result = match msg.room_key() {
                Ok(key) if msg.msg_type == MessageType::JoinRoom => hub.join_room(session, key).await,
                Ok(key) => hub.leave_room(session, key).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                log::debug!("session {session} {:?} failed: {e}", msg.msg_type);
            }
            None
        }
        MessageType::Ping => Some(SyncMessage::pong(session)),
        MessageType::Pong => None,
        other => {
            log::warn!("session {session}: unexpected {other:?} message");
            None
        }
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> Result<(), ConnectionError> {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Request/reply correlation with a per-request timeout
//! - Server pushes delivered as [`SyncEvent`]s
//!
//! There is no offline queue: a disconnect fails every pending request with
//! a transport error and the caller rolls back its optimistic state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use atelier_core::{DocumentKey, SyncError};

use crate::protocol::{Hello, MessageType, ProtocolError, Push, Reply, Request, SyncMessage, Welcome};
use crate::transport::Transport;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    /// Display name sent in `Hello`
    pub name: String,
    pub token: Option<String>,
    /// How long a request waits for its reply
    pub request_timeout: Duration,
    /// Buffered events; pushes beyond this are dropped and reported as
    /// [`SyncEvent::Lagged`]
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            name: "anonymous".to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected(Welcome),
    Disconnected,
    Push(Push),
    /// The application fell behind and this many pushes were dropped.
    /// Every open replica must be refreshed.
    Lagged(u64),
}

/// Requests waiting for a reply.
#[derive(Default)]
struct PendingTable {
    waiting: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,
    hello: Hello,
    state: Arc<RwLock<ConnectionState>>,
    welcome: Option<Welcome>,
    next_request: AtomicU64,
    pending: Arc<Mutex<PendingTable>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let hello = Hello::new(config.name.clone(), config.token.clone());
        Self {
            config,
            hello,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            welcome: None,
            next_request: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(PendingTable::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, introduce ourselves and wait for the server's `Welcome`.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<Welcome, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        match self.establish().await {
            Ok(welcome) => Ok(welcome),
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<Welcome, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.server_url)
            .await
            .map_err(|e| {
                log::warn!("connect to {} failed: {e}", self.config.server_url);
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = SyncMessage::hello(&self.hello)?.encode()?;
        ws_writer
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let welcome = tokio::time::timeout(self.config.request_timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let msg = SyncMessage::decode(&data)?;
                        if msg.msg_type == MessageType::Welcome {
                            return msg.welcome_body();
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            Err(ProtocolError::ConnectionClosed)
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;

        // Outgoing message channel; the writer task owns the sink.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.pending.lock().await = PendingTable::default();
        // weak, so dropping `outgoing_tx` still ends the writer
        let pong_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);
        self.welcome = Some(welcome);
        *self.state.write().await = ConnectionState::Connected;
        if self.event_tx.try_send(SyncEvent::Connected(welcome)).is_err() {
            log::warn!("event queue full, Connected not delivered");
        }
        log::info!(
            "connected to {} as session {} ({:?})",
            self.config.server_url,
            welcome.session_id,
            welcome.principal.privilege
        );

        // Reader task: route replies and pushes
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let session_id = welcome.session_id;
        tokio::spawn(async move {
            // Pushes never wait on the event queue; replies share this loop.
            let mut dropped: u64 = 0;
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg = match SyncMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("dropping undecodable frame: {e}");
                        continue;
                    }
                };
                match msg.msg_type {
                    MessageType::Reply => {
                        let waiter = pending.lock().await.waiting.remove(&msg.request_id);
                        match (waiter, msg.reply_body()) {
                            (Some(waiter), Ok(reply)) => {
                                let _ = waiter.send(reply);
                            }
                            (Some(waiter), Err(e)) => {
                                let _ = waiter.send(Reply::error(SyncError::transport(e.to_string())));
                            }
                            (None, _) => log::debug!("reply for unknown request {}", msg.request_id),
                        }
                    }
                    MessageType::Push => match msg.push_body() {
                        Ok(push) => {
                            if dropped > 0 {
                                match event_tx.try_send(SyncEvent::Lagged(dropped)) {
                                    Ok(()) => dropped = 0,
                                    Err(TrySendError::Full(_)) => {
                                        dropped += 1;
                                        continue;
                                    }
                                    Err(TrySendError::Closed(_)) => continue,
                                }
                            }
                            if let Err(TrySendError::Full(_)) = event_tx.try_send(SyncEvent::Push(push)) {
                                log::warn!("session {session_id}: event queue full, dropping pushes");
                                dropped = 1;
                            }
                        }
                        Err(e) => log::warn!("dropping undecodable push: {e}"),
                    },
                    MessageType::Ping => {
                        if let (Some(tx), Ok(pong)) = (pong_tx.upgrade(), SyncMessage::pong(session_id).encode()) {
                            let _ = tx.send(pong).await;
                        }
                    }
                    _ => {}
                }
            }

            // Connection lost: fail everything still waiting.
            {
                let mut pending = pending.lock().await;
                pending.closed = true;
                pending.waiting.clear();
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
            log::info!("session {session_id} disconnected");
        });

        Ok(welcome)
    }

    /// Close the connection. Pending requests fail with a transport error.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        pending.waiting.clear();
    }

    /// Send one request and wait for its reply.
    pub async fn request(&self, request: Request) -> Result<Reply, SyncError> {
        let (Some(tx), Some(welcome)) = (&self.outgoing_tx, &self.welcome) else {
            return Err(SyncError::transport("not connected"));
        };
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = SyncMessage::request(welcome.session_id, id, &request)?.encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(SyncError::transport("connection closed"));
            }
            pending.waiting.insert(id, reply_tx);
        }
        if tx.send(frame).await.is_err() {
            self.pending.lock().await.waiting.remove(&id);
            return Err(SyncError::transport("connection closed"));
        }

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(SyncError::transport("connection closed before reply")),
            Err(_) => {
                self.pending.lock().await.waiting.remove(&id);
                Err(SyncError::transport(format!(
                    "{} got no reply within {:?}",
                    request.name(),
                    self.config.request_timeout
                )))
            }
        }
    }

    async fn send_room(&self, msg: Result<SyncMessage, ProtocolError>) -> Result<(), SyncError> {
        let Some(tx) = &self.outgoing_tx else {
            return Err(SyncError::transport("not connected"));
        };
        tx.send(msg?.encode()?)
            .await
            .map_err(|_| SyncError::transport("connection closed"))
    }

    /// Send a heartbeat ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let session_id = self.session_id().unwrap_or_default();
        let encoded = SyncMessage::ping(session_id).encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn session_id(&self) -> Option<u64> {
        self.welcome.map(|w| w.session_id)
    }

    pub fn welcome(&self) -> Option<Welcome> {
        self.welcome
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Requests still waiting for a reply.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.waiting.len()
    }
}

impl Transport for SyncClient {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Reply, SyncError>> {
        Box::pin(self.request(request))
    }

    fn join_room(&self, key: DocumentKey) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            let session_id = self.session_id().unwrap_or_default();
            self.send_room(SyncMessage::join_room(session_id, key)).await
        })
    }

    fn leave_room(&self, key: DocumentKey) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            let session_id = self.session_id().unwrap_or_default();
            self.send_room(SyncMessage::leave_room(session_id, key)).await
        })
    }
}

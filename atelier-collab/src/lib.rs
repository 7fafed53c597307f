//! # atelier-collab: Multi-user synchronization layer for Atelier
//!
//! Clients edit local replicas optimistically and submit patch batches; the
//! hub checks them against the authoritative store and fans accepted
//! changes out to the rooms that watch the document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  request / reply    │ (central)   │
//! └──────┬──────┘      + pushes       └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Workspace   │                     │ Hub         │
//! │ + UndoStack │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                  ┌─────────┴─────────┐
//!                                  │ RoomManager       │
//!                                  │ (fan-out)         │
//!                                  └─────────┬─────────┘
//!                                            │
//!                                  ┌─────────┴─────────┐
//!                                  │ DocumentStore     │
//!                                  │ (RocksDB)         │
//!                                  └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room membership and per-session fan-out
//! - [`session`]: Connected sessions and connect-time authentication
//! - [`hub`]: Request handling against the authoritative store
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with request timeouts
//! - [`transport`]: Request seam shared by the client and in-process hub
//! - [`workspace`]: Optimistic local replicas
//! - [`undo`]: Undo/redo history of reversible operations
//! - [`gate`]: Bounded-concurrency token gate
//! - [`thumbnail`]: Thumbnail cache rendered through the gate
//! - [`storage`]: Persistent snapshots and accepted batches

pub mod protocol;
pub mod broadcast;
pub mod session;
pub mod hub;
pub mod server;
pub mod client;
pub mod transport;
pub mod workspace;
pub mod undo;
pub mod gate;
pub mod thumbnail;
pub mod storage;

// Re-exports for convenience
pub use protocol::{Hello, MessageType, ProtocolError, Push, Reply, Request, SyncMessage, Welcome};
pub use broadcast::{BroadcastStats, RoomId, RoomManager, SessionId};
pub use session::{Authenticator, Session, SessionRegistry, TokenTable};
pub use hub::{Hub, LocalTransport, ServerStats};
pub use server::{ConfigError, ServerConfig, ServerError, SyncServer};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use transport::{Submitted, Transport};
pub use workspace::{Committed, Workspace};
pub use undo::{CreateOperation, DeleteOperation, OperationGroup, PatchOperation, UndoStack, UndoableOperation};
pub use gate::TokenGate;
pub use thumbnail::{RenderError, Thumbnail, ThumbnailCache, ThumbnailRenderer};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError, StoredDocument};

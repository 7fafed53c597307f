//! Wire protocol between authoring clients and the sync server.
//!
//! Envelope (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬────────────┬──────────┐
//! │ msg_type │ session_id │ request_id │ payload  │
//! │ 1 byte   │ varint     │ varint     │ variable │
//! └──────────┴────────────┴────────────┴──────────┘
//! ```
//!
//! Payloads are JSON: documents are arbitrary `serde_json::Value` trees,
//! which a non-self-describing format cannot carry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use atelier_core::{
    BinaryAsset, Document, DocumentKey, DocumentSummary, ErrorReply, Ownership, Patch, PatchBatch,
    PerPatchResult, Principal, ResourceKind, SyncError, TenantId,
};

/// Message types of the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client introduction, first message on a connection
    Hello = 1,
    /// Server answer to `Hello` with the assigned session
    Welcome = 2,
    /// Client request expecting exactly one `Reply`
    Request = 3,
    /// Answer to a `Request`, correlated by `request_id`
    Reply = 4,
    /// Unsolicited server-to-client notification
    Push = 5,
    /// Open a map (join its room)
    JoinRoom = 6,
    /// Close a map (leave its room)
    LeaveRoom = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Client identity presented on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Stable per-process client id, for log correlation across reconnects.
    pub client_id: Uuid,
    pub name: String,
    pub token: Option<String>,
}

impl Hello {
    pub fn new(name: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            name: name.into(),
            token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: u64,
    pub principal: Principal,
}

/// Client-to-server request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    SubmitChanges {
        key: DocumentKey,
        batch: PatchBatch,
        #[serde(default)]
        execute_as_many_as_possible: bool,
    },
    Create {
        kind: ResourceKind,
        /// Owning tenant; defaults to the requester's tenant.
        tenant: Option<TenantId>,
        parent: Option<u64>,
        snapshot: Value,
        #[serde(default)]
        assets: Vec<BinaryAsset>,
    },
    Delete {
        key: DocumentKey,
    },
    Undelete {
        key: DocumentKey,
    },
    Get {
        key: DocumentKey,
    },
    List {
        kind: ResourceKind,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::SubmitChanges { .. } => "submit_changes",
            Request::Create { .. } => "create",
            Request::Delete { .. } => "delete",
            Request::Undelete { .. } => "undelete",
            Request::Get { .. } => "get",
            Request::List { .. } => "list",
        }
    }
}

/// Server answer to a single [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// All-or-nothing batch accepted.
    Ack { version: u64 },
    /// As-many-as-possible batch evaluated.
    PerPatch {
        version: u64,
        results: Vec<PerPatchResult>,
    },
    Snapshot { document: Document },
    List {
        kind: ResourceKind,
        items: Vec<DocumentSummary>,
    },
    Error { error: ErrorReply },
}

impl Reply {
    pub fn error(error: SyncError) -> Self {
        Reply::Error {
            error: error.into(),
        }
    }

    /// Split the error variant off into a `Result`.
    pub fn into_result(self) -> Result<Reply, SyncError> {
        match self {
            Reply::Error { error } => Err(error.into()),
            other => Ok(other),
        }
    }
}

/// Server-initiated notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "push", rename_all = "snake_case")]
pub enum Push {
    /// A batch was accepted; `patches` are the forward patches actually applied.
    Changed {
        key: DocumentKey,
        version: u64,
        patches: Vec<Patch>,
    },
    Created { document: Document },
    Deleted { key: DocumentKey },
    ListUpdated {
        kind: ResourceKind,
        owner: Ownership,
        items: Vec<DocumentSummary>,
    },
    /// The session was removed from a map room (the map was deleted).
    RoomClosed { key: DocumentKey },
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender session (0 before `Welcome`, and for server pushes).
    pub session_id: u64,
    /// Correlates a `Reply` with its `Request`; 0 otherwise.
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_json<T: Serialize>(
        msg_type: MessageType,
        session_id: u64,
        request_id: u64,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(body).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type,
            session_id,
            request_id,
            payload,
        })
    }

    pub fn hello(hello: &Hello) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Hello, 0, 0, hello)
    }

    pub fn welcome(welcome: &Welcome) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Welcome, welcome.session_id, 0, welcome)
    }

    pub fn request(session_id: u64, request_id: u64, request: &Request) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Request, session_id, request_id, request)
    }

    pub fn reply(request_id: u64, reply: &Reply) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Reply, 0, request_id, reply)
    }

    pub fn push(push: &Push) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Push, 0, 0, push)
    }

    pub fn join_room(session_id: u64, key: DocumentKey) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::JoinRoom, session_id, 0, &key)
    }

    pub fn leave_room(session_id: u64, key: DocumentKey) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::LeaveRoom, session_id, 0, &key)
    }

    pub fn ping(session_id: u64) -> Self {
        Self {
            msg_type: MessageType::Ping,
            session_id,
            request_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(session_id: u64) -> Self {
        Self {
            msg_type: MessageType::Pong,
            session_id,
            request_id: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn body<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn hello_body(&self) -> Result<Hello, ProtocolError> {
        self.body(MessageType::Hello)
    }

    pub fn welcome_body(&self) -> Result<Welcome, ProtocolError> {
        self.body(MessageType::Welcome)
    }

    pub fn request_body(&self) -> Result<Request, ProtocolError> {
        self.body(MessageType::Request)
    }

    pub fn reply_body(&self) -> Result<Reply, ProtocolError> {
        self.body(MessageType::Reply)
    }

    pub fn push_body(&self) -> Result<Push, ProtocolError> {
        self.body(MessageType::Push)
    }

    /// Map key of a `JoinRoom` or `LeaveRoom` message.
    pub fn room_key(&self) -> Result<DocumentKey, ProtocolError> {
        match self.msg_type {
            MessageType::JoinRoom | MessageType::LeaveRoom => serde_json::from_slice(&self.payload)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
            actual => Err(ProtocolError::InvalidMessageType {
                expected: MessageType::JoinRoom,
                actual,
            }),
        }
    }
}

/// Decode a raw pushed frame straight into its [`Push`].
pub fn decode_push(bytes: &[u8]) -> Result<Push, ProtocolError> {
    SyncMessage::decode(bytes)?.push_body()
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::transport(e.to_string())
    }
}

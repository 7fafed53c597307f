//! Error taxonomy shared by the server, the wire protocol and the client.
//!
//! Every request resolves with either a success value or exactly one
//! [`SyncError`]. On the wire the error travels as an [`ErrorReply`], which
//! adds a stable category code and a message key for the UI.

use serde::{Deserialize, Serialize};

use crate::document::{DocumentKey, ResourceKind};

/// Failure of a synchronization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SyncError {
    /// The requester's privilege or tenant does not permit the mutation.
    #[error("insufficient rights to {operation} {kind}")]
    Authorization { operation: String, kind: ResourceKind },

    /// The optimistic-lock precondition of patch `index` failed.
    #[error("{key} was changed by someone else (patch #{index})")]
    Conflict { key: DocumentKey, index: usize },

    /// The target resource does not exist (or was deleted concurrently).
    #[error("{0} not found")]
    NotFound(DocumentKey),

    /// Structurally invalid request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Disconnect, timeout or undecodable reply.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        SyncError::Transport(msg.into())
    }

    /// Category code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Authorization { .. } => ErrorCode::Authorization,
            SyncError::Conflict { .. } => ErrorCode::Conflict,
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::Validation(_) => ErrorCode::Validation,
            SyncError::Transport(_) => ErrorCode::Transport,
        }
    }

    /// Whether a client may reasonably offer the user a manual retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Conflict { .. } | SyncError::Transport(_))
    }
}

/// Stable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Authorization,
    Conflict,
    NotFound,
    Validation,
    Transport,
}

impl ErrorCode {
    /// Translation key the client shows to the user.
    pub fn message_key(self) -> &'static str {
        match self {
            ErrorCode::Authorization => "error.not_authorized",
            ErrorCode::Conflict => "error.changed_by_someone_else",
            ErrorCode::NotFound => "error.not_found",
            ErrorCode::Validation => "error.invalid_request",
            ErrorCode::Transport => "error.transport",
        }
    }
}

/// Structured error reply as sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message_key: String,
    pub error: SyncError,
}

impl From<SyncError> for ErrorReply {
    fn from(error: SyncError) -> Self {
        let code = error.code();
        Self {
            code,
            message_key: code.message_key().to_string(),
            error,
        }
    }
}

impl From<ErrorReply> for SyncError {
    fn from(reply: ErrorReply) -> Self {
        reply.error
    }
}

/// Failure to apply a single patch to a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("path does not resolve to a value")]
    NotFound,
    #[error("index out of bounds")]
    InvalidIndex,
    #[error("target is not a container of the expected kind")]
    InvalidTarget,
    #[error("operation needs a non-empty path")]
    EmptyPath,
    #[error("key already exists")]
    KeyExists,
}

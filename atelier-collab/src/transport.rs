//! Client-side request seam.
//!
//! [`Transport`] is what the workspace and the undo stack talk to. The
//! WebSocket [`SyncClient`](crate::client::SyncClient) implements it for
//! real deployments; [`LocalTransport`](crate::hub::LocalTransport) drives a
//! [`Hub`](crate::hub::Hub) in-process.

use futures_util::future::BoxFuture;
use serde_json::Value;

use atelier_core::{
    BinaryAsset, Document, DocumentKey, DocumentSummary, PatchBatch, PerPatchResult, ResourceKind,
    SyncError, TenantId,
};

use crate::protocol::{Reply, Request};

/// Outcome of a successful change submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    /// All-or-nothing batch accepted at `version`.
    Accepted { version: u64 },
    /// As-many-as-possible batch evaluated; `version` is the document
    /// version after the applied subset.
    PerPatch {
        version: u64,
        results: Vec<PerPatchResult>,
    },
}

impl Submitted {
    pub fn version(&self) -> u64 {
        match self {
            Submitted::Accepted { version } | Submitted::PerPatch { version, .. } => *version,
        }
    }
}

pub trait Transport: Send + Sync {
    /// Send one request and wait for its reply. Error replies resolve to
    /// `Err`.
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Reply, SyncError>>;

    /// Open a map: pushes for it are delivered from now on.
    fn join_room(&self, key: DocumentKey) -> BoxFuture<'_, Result<(), SyncError>>;

    fn leave_room(&self, key: DocumentKey) -> BoxFuture<'_, Result<(), SyncError>>;

    fn submit_changes(
        &self,
        key: DocumentKey,
        batch: PatchBatch,
        execute_as_many_as_possible: bool,
    ) -> BoxFuture<'_, Result<Submitted, SyncError>> {
        Box::pin(async move {
            let request = Request::SubmitChanges {
                key,
                batch,
                execute_as_many_as_possible,
            };
            match self.call(request).await? {
                Reply::Ack { version } => Ok(Submitted::Accepted { version }),
                Reply::PerPatch { version, results } => Ok(Submitted::PerPatch { version, results }),
                other => Err(unexpected("submit_changes", &other)),
            }
        })
    }

    fn get(&self, key: DocumentKey) -> BoxFuture<'_, Result<Document, SyncError>> {
        Box::pin(async move {
            match self.call(Request::Get { key }).await? {
                Reply::Snapshot { document } => Ok(document),
                other => Err(unexpected("get", &other)),
            }
        })
    }

    fn create(
        &self,
        kind: ResourceKind,
        tenant: Option<TenantId>,
        parent: Option<u64>,
        snapshot: Value,
        assets: Vec<BinaryAsset>,
    ) -> BoxFuture<'_, Result<Document, SyncError>> {
        Box::pin(async move {
            let request = Request::Create {
                kind,
                tenant,
                parent,
                snapshot,
                assets,
            };
            match self.call(request).await? {
                Reply::Snapshot { document } => Ok(document),
                other => Err(unexpected("create", &other)),
            }
        })
    }

    fn delete(&self, key: DocumentKey) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            match self.call(Request::Delete { key }).await? {
                Reply::Ack { .. } => Ok(()),
                other => Err(unexpected("delete", &other)),
            }
        })
    }

    fn undelete(&self, key: DocumentKey) -> BoxFuture<'_, Result<Document, SyncError>> {
        Box::pin(async move {
            match self.call(Request::Undelete { key }).await? {
                Reply::Snapshot { document } => Ok(document),
                other => Err(unexpected("undelete", &other)),
            }
        })
    }

    fn list(&self, kind: ResourceKind) -> BoxFuture<'_, Result<Vec<DocumentSummary>, SyncError>> {
        Box::pin(async move {
            match self.call(Request::List { kind }).await? {
                Reply::List { items, .. } => Ok(items),
                other => Err(unexpected("list", &other)),
            }
        })
    }
}

fn unexpected(operation: &str, reply: &Reply) -> SyncError {
    SyncError::transport(format!("unexpected reply to {operation}: {reply:?}"))
}

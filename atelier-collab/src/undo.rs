//! Undo/redo history of asynchronous, reversible user actions.
//!
//! Every entry performs a network round trip when executed or reversed, so
//! any step can fail. The stack only changes after a step succeeded: a
//! failed `push` records nothing, a failed `undo` leaves the entry on the
//! undo side and a failed `redo` leaves it on the redo side.
//!
//! One history mutation runs at a time. The history lock is held across the
//! round trip, so concurrent `push`/`undo`/`redo` calls queue up instead of
//! interleaving.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;

use atelier_core::{BinaryAsset, DocumentKey, Patch, PatchBatch, ResourceKind, SyncError, TenantId};

use crate::transport::Transport;
use crate::workspace::Workspace;

/// Default number of entries kept on the undo side.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// A named, reversible unit of user-initiated change.
///
/// Implementations capture the state they need to reverse themselves when
/// they are constructed or executed, never by reading ambient state later.
pub trait UndoableOperation: Send + Sync {
    fn name(&self) -> &str;

    /// Perform (or, with `is_redo`, perform again) the change.
    fn execute(&mut self, is_redo: bool) -> BoxFuture<'_, Result<(), SyncError>>;

    /// Revert exactly what the last successful `execute` changed.
    fn reverse(&mut self) -> BoxFuture<'_, Result<(), SyncError>>;
}

#[derive(Default)]
struct History {
    done: VecDeque<Box<dyn UndoableOperation>>,
    undone: Vec<Box<dyn UndoableOperation>>,
}

pub struct UndoStack {
    history: Mutex<History>,
    max_depth: usize,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl UndoStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            history: Mutex::new(History::default()),
            max_depth: max_depth.max(1),
        }
    }

    /// Execute `operation` and record it. Clears the redo side.
    pub async fn push(&self, mut operation: Box<dyn UndoableOperation>) -> Result<(), SyncError> {
        let mut history = self.history.lock().await;
        if let Err(e) = operation.execute(false).await {
            log::info!("{} failed: {e}", operation.name());
            return Err(e);
        }
        history.undone.clear();
        self.record(&mut history, operation);
        Ok(())
    }

    /// Reverse the most recent entry. Returns `false` if there was nothing
    /// to undo.
    pub async fn undo(&self) -> Result<bool, SyncError> {
        let mut history = self.history.lock().await;
        let Some(mut operation) = history.done.pop_back() else {
            return Ok(false);
        };
        match operation.reverse().await {
            Ok(()) => {
                log::debug!("undid {}", operation.name());
                history.undone.push(operation);
                Ok(true)
            }
            Err(e) => {
                log::info!("undo of {} failed: {e}", operation.name());
                history.done.push_back(operation);
                Err(e)
            }
        }
    }

    /// Re-execute the most recently undone entry. Returns `false` if there
    /// was nothing to redo.
    pub async fn redo(&self) -> Result<bool, SyncError> {
        let mut history = self.history.lock().await;
        let Some(mut operation) = history.undone.pop() else {
            return Ok(false);
        };
        match operation.execute(true).await {
            Ok(()) => {
                log::debug!("redid {}", operation.name());
                self.record(&mut history, operation);
                Ok(true)
            }
            Err(e) => {
                log::info!("redo of {} failed: {e}", operation.name());
                history.undone.push(operation);
                Err(e)
            }
        }
    }

    fn record(&self, history: &mut History, operation: Box<dyn UndoableOperation>) {
        history.done.push_back(operation);
        while history.done.len() > self.max_depth {
            if let Some(dropped) = history.done.pop_front() {
                log::trace!("{} fell out of the undo window", dropped.name());
            }
        }
    }

    pub async fn can_undo(&self) -> bool {
        !self.history.lock().await.done.is_empty()
    }

    pub async fn can_redo(&self) -> bool {
        !self.history.lock().await.undone.is_empty()
    }

    /// Name of the entry `undo` would reverse.
    pub async fn next_undo(&self) -> Option<String> {
        self.history.lock().await.done.back().map(|op| op.name().to_string())
    }

    pub async fn next_redo(&self) -> Option<String> {
        self.history.lock().await.undone.last().map(|op| op.name().to_string())
    }

    pub async fn depth(&self) -> (usize, usize) {
        let history = self.history.lock().await;
        (history.done.len(), history.undone.len())
    }

    pub async fn clear(&self) {
        let mut history = self.history.lock().await;
        history.done.clear();
        history.undone.clear();
    }
}

/// Edit of one document through the workspace.
///
/// The forward/inverse pairs are computed against the local replica when
/// the operation is built. With as-many-as-possible submission only part of
/// the batch may land; the applied subset is what `reverse` undoes.
pub struct PatchOperation<T: Transport + ?Sized> {
    workspace: Arc<Workspace<T>>,
    name: String,
    key: DocumentKey,
    batch: PatchBatch,
    execute_as_many_as_possible: bool,
    applied: Option<PatchBatch>,
}

impl<T: Transport + ?Sized> PatchOperation<T> {
    pub async fn new(
        workspace: Arc<Workspace<T>>,
        name: impl Into<String>,
        key: DocumentKey,
        patches: Vec<Patch>,
    ) -> Result<Self, SyncError> {
        let batch = workspace.prepare(key, patches).await?;
        Ok(Self {
            workspace,
            name: name.into(),
            key,
            batch,
            execute_as_many_as_possible: false,
            applied: None,
        })
    }

    pub fn as_many_as_possible(mut self) -> Self {
        self.execute_as_many_as_possible = true;
        self
    }

    pub fn batch(&self) -> &PatchBatch {
        &self.batch
    }

    /// Subset of the batch the server applied on the last execution.
    pub fn applied(&self) -> Option<&PatchBatch> {
        self.applied.as_ref()
    }
}

impl<T: Transport + ?Sized> UndoableOperation for PatchOperation<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, _is_redo: bool) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            let committed = self
                .workspace
                .submit_batch(self.key, self.batch.clone(), self.execute_as_many_as_possible)
                .await?;
            if committed.applied.is_empty() {
                return Err(SyncError::Conflict {
                    key: self.key,
                    index: 0,
                });
            }
            self.applied = Some(committed.applied);
            Ok(())
        })
    }

    fn reverse(&mut self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            let Some(applied) = &self.applied else {
                return Ok(());
            };
            self.workspace
                .submit_batch(self.key, applied.inverted(), false)
                .await?;
            self.applied = None;
            Ok(())
        })
    }
}

/// Several operations recorded as one history entry.
///
/// Executes in order and reverses last-applied-first. If a member fails,
/// the members that already ran are reverted before the error surfaces.
pub struct OperationGroup {
    name: String,
    operations: Vec<Box<dyn UndoableOperation>>,
}

impl OperationGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
        }
    }

    pub fn with(mut self, operation: Box<dyn UndoableOperation>) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl UndoableOperation for OperationGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, is_redo: bool) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            for i in 0..self.operations.len() {
                if let Err(e) = self.operations[i].execute(is_redo).await {
                    for op in self.operations[..i].iter_mut().rev() {
                        if let Err(undo_err) = op.reverse().await {
                            log::warn!("{}: could not revert {}: {undo_err}", self.name, op.name());
                        }
                    }
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    fn reverse(&mut self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            let n = self.operations.len();
            for i in (0..n).rev() {
                if let Err(e) = self.operations[i].reverse().await {
                    for op in self.operations[i + 1..].iter_mut() {
                        if let Err(redo_err) = op.execute(true).await {
                            log::warn!("{}: could not restore {}: {redo_err}", self.name, op.name());
                        }
                    }
                    return Err(e);
                }
            }
            Ok(())
        })
    }
}

/// Document creation. Undo deletes the document, redo restores it.
pub struct CreateOperation<T: Transport + ?Sized> {
    workspace: Arc<Workspace<T>>,
    name: String,
    kind: ResourceKind,
    tenant: Option<TenantId>,
    parent: Option<u64>,
    snapshot: Value,
    assets: Vec<BinaryAsset>,
    created: Option<DocumentKey>,
}

impl<T: Transport + ?Sized> CreateOperation<T> {
    pub fn new(workspace: Arc<Workspace<T>>, name: impl Into<String>, kind: ResourceKind, snapshot: Value) -> Self {
        Self {
            workspace,
            name: name.into(),
            kind,
            tenant: None,
            parent: None,
            snapshot,
            assets: Vec::new(),
            created: None,
        }
    }

    pub fn in_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn under(mut self, parent: u64) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_asset(mut self, asset: BinaryAsset) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn created(&self) -> Option<DocumentKey> {
        self.created
    }
}

impl<T: Transport + ?Sized> UndoableOperation for CreateOperation<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, is_redo: bool) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            match (is_redo, self.created) {
                (true, Some(key)) => {
                    self.workspace.undelete(key).await?;
                }
                _ => {
                    let document = self
                        .workspace
                        .create(
                            self.kind,
                            self.tenant,
                            self.parent,
                            self.snapshot.clone(),
                            self.assets.clone(),
                        )
                        .await?;
                    self.created = Some(document.key);
                }
            }
            Ok(())
        })
    }

    fn reverse(&mut self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            match self.created {
                Some(key) => self.workspace.delete(key).await,
                None => Ok(()),
            }
        })
    }
}

/// Document deletion. Undo restores the tombstoned document.
pub struct DeleteOperation<T: Transport + ?Sized> {
    workspace: Arc<Workspace<T>>,
    name: String,
    key: DocumentKey,
}

impl<T: Transport + ?Sized> DeleteOperation<T> {
    pub fn new(workspace: Arc<Workspace<T>>, name: impl Into<String>, key: DocumentKey) -> Self {
        Self {
            workspace,
            name: name.into(),
            key,
        }
    }
}

impl<T: Transport + ?Sized> UndoableOperation for DeleteOperation<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, _is_redo: bool) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(self.workspace.delete(self.key))
    }

    fn reverse(&mut self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            self.workspace.undelete(self.key).await?;
            Ok(())
        })
    }
}

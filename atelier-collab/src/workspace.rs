//! Client-side optimistic replicas.
//!
//! A [`Workspace`] holds the local copy of every document the user has
//! open. Edits are applied locally first and then submitted; a rejection,
//! a timeout or a conflict rolls the local copy back (or reloads it) so it
//! never drifts from what the server accepted.
//!
//! Remote changes arrive as [`Push`]es and are applied in version order.
//! A gap in the version sequence means a push was missed, and the replica
//! is reloaded with `Get`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use atelier_core::patch::apply_all;
use atelier_core::{
    BinaryAsset, Document, DocumentKey, Patch, PatchBatch, PerPatchResult, ResourceKind,
    SyncError, TenantId,
};

use crate::client::SyncEvent;
use crate::protocol::Push;
use crate::transport::{Submitted, Transport};

/// A submission the server accepted (fully or in part).
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub version: u64,
    /// The pairs that were applied on the server, in input order.
    pub applied: PatchBatch,
    /// Per-patch outcome for as-many-as-possible submissions.
    pub results: Option<Vec<PerPatchResult>>,
}

impl Committed {
    pub fn is_partial(&self) -> bool {
        self.results
            .as_ref()
            .is_some_and(|r| r.contains(&PerPatchResult::Conflict))
    }
}

pub struct Workspace<T: Transport + ?Sized> {
    transport: Arc<T>,
    replicas: Mutex<HashMap<DocumentKey, Document>>,
}

impl<T: Transport + ?Sized> Workspace<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            replicas: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Load a document and, for maps, join its room.
    pub async fn open(&self, key: DocumentKey) -> Result<Document, SyncError> {
        if key.kind == ResourceKind::Map {
            self.transport.join_room(key).await?;
        }
        self.refresh(key).await
    }

    pub async fn close(&self, key: DocumentKey) -> Result<(), SyncError> {
        self.replicas.lock().await.remove(&key);
        if key.kind == ResourceKind::Map {
            self.transport.leave_room(key).await?;
        }
        Ok(())
    }

    /// Replace the local replica with the server's current snapshot.
    pub async fn refresh(&self, key: DocumentKey) -> Result<Document, SyncError> {
        let document = self.transport.get(key).await?;
        log::debug!("refreshed {key} at version {}", document.version);
        self.replicas.lock().await.insert(key, document.clone());
        Ok(document)
    }

    /// Reload every open replica from the server.
    pub async fn refresh_all(&self) -> Result<(), SyncError> {
        let keys: Vec<DocumentKey> = self.replicas.lock().await.keys().copied().collect();
        for key in keys {
            self.refresh(key).await?;
        }
        Ok(())
    }

    pub async fn document(&self, key: DocumentKey) -> Option<Document> {
        self.replicas.lock().await.get(&key).cloned()
    }

    pub async fn value(&self, key: DocumentKey) -> Option<Value> {
        self.replicas.lock().await.get(&key).map(|d| d.value.clone())
    }

    pub async fn is_open(&self, key: DocumentKey) -> bool {
        self.replicas.lock().await.contains_key(&key)
    }

    /// Pair `patches` with their inverses against the local replica without
    /// changing it.
    pub async fn prepare(&self, key: DocumentKey, patches: Vec<Patch>) -> Result<PatchBatch, SyncError> {
        let replicas = self.replicas.lock().await;
        let doc = replicas.get(&key).ok_or(SyncError::NotFound(key))?;
        let mut scratch = doc.value.clone();
        PatchBatch::from_local(&mut scratch, patches)
            .map_err(|e| SyncError::validation(format!("{key}: {e}")))
    }

    /// Apply `patches` locally and submit them.
    pub async fn submit(
        &self,
        key: DocumentKey,
        patches: Vec<Patch>,
        execute_as_many_as_possible: bool,
    ) -> Result<Committed, SyncError> {
        let (batch, base) = {
            let mut replicas = self.replicas.lock().await;
            let doc = replicas.get_mut(&key).ok_or(SyncError::NotFound(key))?;
            let batch = PatchBatch::from_local(&mut doc.value, patches)
                .map_err(|e| SyncError::validation(format!("{key}: {e}")))?;
            (batch, doc.version)
        };
        self.commit(key, batch, base, execute_as_many_as_possible).await
    }

    /// Apply a prepared batch locally and submit it. Undo and redo go
    /// through here with the batch they recorded.
    pub async fn submit_batch(
        &self,
        key: DocumentKey,
        batch: PatchBatch,
        execute_as_many_as_possible: bool,
    ) -> Result<Committed, SyncError> {
        let base = {
            let mut replicas = self.replicas.lock().await;
            let doc = replicas.get_mut(&key).ok_or(SyncError::NotFound(key))?;
            apply_all(&mut doc.value, &batch.patches)
                .map_err(|e| SyncError::validation(format!("{key}: {e}")))?;
            doc.version
        };
        self.commit(key, batch, base, execute_as_many_as_possible).await
    }

    async fn commit(
        &self,
        key: DocumentKey,
        batch: PatchBatch,
        base: u64,
        execute_as_many_as_possible: bool,
    ) -> Result<Committed, SyncError> {
        match self
            .transport
            .submit_changes(key, batch.clone(), execute_as_many_as_possible)
            .await
        {
            Ok(Submitted::Accepted { version }) => {
                self.settle(key, base, version).await;
                Ok(Committed {
                    version,
                    applied: batch,
                    results: None,
                })
            }
            Ok(Submitted::PerPatch { version, results }) => {
                let applied = accepted_subset(&batch, &results);
                if applied.len() != batch.len() {
                    self.rewind(key, &batch, &applied).await;
                }
                if !applied.is_empty() {
                    self.settle(key, base, version).await;
                }
                Ok(Committed {
                    version,
                    applied,
                    results: Some(results),
                })
            }
            Err(error) => {
                log::info!("{key}: submission rejected: {error}");
                let reverted = self.rewind(key, &batch, &PatchBatch::default()).await;
                if reverted && matches!(error, SyncError::Conflict { .. }) {
                    self.reload(key).await;
                }
                Err(error)
            }
        }
    }

    /// Record the version the server assigned to our own batch.
    async fn settle(&self, key: DocumentKey, base: u64, version: u64) {
        let in_sequence = {
            let mut replicas = self.replicas.lock().await;
            match replicas.get_mut(&key) {
                Some(doc) if doc.version == base && version == base + 1 => {
                    doc.version = version;
                    true
                }
                Some(_) => false,
                None => true,
            }
        };
        if !in_sequence {
            self.reload(key).await;
        }
    }

    /// Undo `batch` locally, then re-apply the `keep` subset. Returns
    /// false when the replica had to be reloaded instead.
    async fn rewind(&self, key: DocumentKey, batch: &PatchBatch, keep: &PatchBatch) -> bool {
        let consistent = {
            let mut replicas = self.replicas.lock().await;
            match replicas.get_mut(&key) {
                Some(doc) => {
                    let mut value = doc.value.clone();
                    let ok = apply_all(&mut value, &batch.inverted().patches).is_ok()
                        && apply_all(&mut value, &keep.patches).is_ok();
                    if ok {
                        doc.value = value;
                    }
                    ok
                }
                None => return true,
            }
        };
        if !consistent {
            log::warn!("{key}: local rollback failed, reloading");
            self.reload(key).await;
        }
        consistent
    }

    async fn reload(&self, key: DocumentKey) {
        if let Err(e) = self.refresh(key).await {
            log::warn!("{key}: reload failed: {e}");
        }
    }

    /// Apply a server push to the local replicas.
    pub async fn apply_push(&self, push: &Push) -> Result<(), SyncError> {
        match push {
            Push::Changed { key, version, patches } => {
                let stale = {
                    let mut replicas = self.replicas.lock().await;
                    let Some(doc) = replicas.get_mut(key) else {
                        return Ok(());
                    };
                    if *version <= doc.version {
                        false
                    } else if *version == doc.version + 1 {
                        match apply_all(&mut doc.value, patches) {
                            Ok(_) => {
                                doc.version = *version;
                                false
                            }
                            Err(e) => {
                                log::warn!("{key}: remote change does not apply locally: {e}");
                                true
                            }
                        }
                    } else {
                        log::debug!("{key}: missed versions {}..{version}", doc.version + 1);
                        true
                    }
                };
                if stale {
                    self.refresh(*key).await?;
                }
            }
            Push::Deleted { key } | Push::RoomClosed { key } => {
                self.replicas.lock().await.remove(key);
            }
            Push::Created { .. } | Push::ListUpdated { .. } => {}
        }
        Ok(())
    }

    pub async fn apply_event(&self, event: &SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::Push(push) => self.apply_push(push).await,
            SyncEvent::Lagged(dropped) => {
                log::info!("{dropped} pushes dropped, refreshing open documents");
                self.refresh_all().await
            }
            SyncEvent::Connected(_) | SyncEvent::Disconnected => Ok(()),
        }
    }

    pub async fn create(
        &self,
        kind: ResourceKind,
        tenant: Option<TenantId>,
        parent: Option<u64>,
        snapshot: Value,
        assets: Vec<BinaryAsset>,
    ) -> Result<Document, SyncError> {
        let document = self
            .transport
            .create(kind, tenant, parent, snapshot, assets)
            .await?;
        self.replicas
            .lock()
            .await
            .insert(document.key, document.clone());
        Ok(document)
    }

    pub async fn delete(&self, key: DocumentKey) -> Result<(), SyncError> {
        self.transport.delete(key).await?;
        self.replicas.lock().await.remove(&key);
        Ok(())
    }

    pub async fn undelete(&self, key: DocumentKey) -> Result<Document, SyncError> {
        let document = self.transport.undelete(key).await?;
        self.replicas.lock().await.insert(key, document.clone());
        Ok(document)
    }
}

fn accepted_subset(batch: &PatchBatch, results: &[PerPatchResult]) -> PatchBatch {
    let mut applied = PatchBatch::default();
    for ((patch, inverse), result) in batch
        .patches
        .iter()
        .zip(batch.inverse_patches.iter())
        .zip(results)
    {
        if *result == PerPatchResult::Success {
            applied.patches.push(patch.clone());
            applied.inverse_patches.push(inverse.clone());
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, LocalTransport};
    use crate::protocol::{decode_push, Hello};
    use crate::server::ServerConfig;
    use crate::session::TokenTable;
    use atelier_core::{path, Ownership, Principal, Privilege};
    use serde_json::json;

    const MAP3: DocumentKey = DocumentKey::new(ResourceKind::Map, 3);

    async fn hub() -> Arc<Hub> {
        let tokens = TokenTable::new()
            .with_token("a", Principal::tenant(Privilege::TenantAdmin, TenantId(1)))
            .with_token("b", Principal::tenant(Privilege::TenantParticipant, TenantId(1)))
            .with_token("guest", Principal::tenant(Privilege::TenantPlayer, TenantId(1)));
        let hub = Arc::new(Hub::new(ServerConfig::default(), Arc::new(tokens)));
        hub.insert(Document::new(
            MAP3,
            Ownership::Tenant(TenantId(1)),
            json!({"name": "Cellar", "height": 1, "enemies": ["rat"]}),
        ))
        .await;
        hub
    }

    async fn workspace(
        hub: &Arc<Hub>,
        token: &str,
    ) -> (Workspace<LocalTransport>, tokio::sync::mpsc::Receiver<crate::broadcast::Frame>) {
        let (transport, rx) = LocalTransport::connect(hub.clone(), &Hello::new(token, Some(token.into()))).await;
        let ws = Workspace::new(Arc::new(transport));
        ws.open(MAP3).await.unwrap();
        (ws, rx)
    }

    #[tokio::test]
    async fn test_submit_updates_replica_and_version() {
        let hub = hub().await;
        let (ws, _rx) = workspace(&hub, "a").await;

        let committed = ws
            .submit(MAP3, vec![Patch::set(path!["height"], json!(2))], false)
            .await
            .unwrap();
        assert_eq!(committed.version, 1);
        assert!(!committed.is_partial());

        let local = ws.document(MAP3).await.unwrap();
        assert_eq!(local.version, 1);
        assert_eq!(local.value, hub.document(MAP3).await.unwrap().value);
    }

    #[tokio::test]
    async fn test_rejected_submission_rolls_back() {
        let hub = hub().await;
        let (ws, _rx) = workspace(&hub, "guest").await;
        let before = ws.value(MAP3).await.unwrap();

        let err = ws
            .submit(MAP3, vec![Patch::set(path!["height"], json!(9))], false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Authorization { .. }));
        assert_eq!(ws.value(MAP3).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_and_reloads() {
        let hub = hub().await;
        let (a, _arx) = workspace(&hub, "a").await;
        let (b, _brx) = workspace(&hub, "b").await;

        a.submit(MAP3, vec![Patch::set(path!["height"], json!(2))], false)
            .await
            .unwrap();
        // b has not applied a's push yet
        let err = b
            .submit(MAP3, vec![Patch::set(path!["height"], json!(5))], false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));

        let local = b.document(MAP3).await.unwrap();
        assert_eq!(local.version, 1);
        assert_eq!(local.value["height"], json!(2));
    }

    #[tokio::test]
    async fn test_partial_submission_keeps_only_accepted() {
        let hub = hub().await;
        let (a, _arx) = workspace(&hub, "a").await;
        let (b, _brx) = workspace(&hub, "b").await;

        a.submit(MAP3, vec![Patch::set(path!["height"], json!(2))], false)
            .await
            .unwrap();
        let committed = b
            .submit(
                MAP3,
                vec![
                    Patch::set(path!["name"], json!("Vault")),
                    Patch::set(path!["height"], json!(7)),
                ],
                true,
            )
            .await
            .unwrap();
        assert!(committed.is_partial());
        assert_eq!(committed.applied.len(), 1);

        let server = hub.document(MAP3).await.unwrap();
        assert_eq!(server.value["name"], json!("Vault"));
        assert_eq!(server.value["height"], json!(2));
        // version gap (a's batch) forces a reload, which converges
        assert_eq!(b.document(MAP3).await.unwrap().value, server.value);
    }

    #[tokio::test]
    async fn test_pushes_converge_replicas() {
        let hub = hub().await;
        let (a, _arx) = workspace(&hub, "a").await;
        let (b, mut brx) = workspace(&hub, "b").await;

        a.submit(MAP3, vec![Patch::insert(path!["enemies", 1usize], json!("bat"))], false)
            .await
            .unwrap();
        a.submit(MAP3, vec![Patch::set(path!["height"], json!(3))], false)
            .await
            .unwrap();

        while let Ok(frame) = brx.try_recv() {
            b.apply_push(&decode_push(&frame).unwrap()).await.unwrap();
        }
        assert_eq!(b.document(MAP3).await, a.document(MAP3).await);
    }

    #[tokio::test]
    async fn test_stale_push_triggers_refresh() {
        let hub = hub().await;
        let (ws, _rx) = workspace(&hub, "b").await;
        let push = Push::Changed {
            key: MAP3,
            version: 5,
            patches: vec![Patch::set(path!["height"], json!(40))],
        };
        ws.apply_push(&push).await.unwrap();
        // reloaded from the server, not patched
        assert_eq!(ws.document(MAP3).await.unwrap().value["height"], json!(1));
    }

    #[tokio::test]
    async fn test_delete_push_drops_replica() {
        let hub = hub().await;
        let (ws, _rx) = workspace(&hub, "b").await;
        ws.apply_push(&Push::Deleted { key: MAP3 }).await.unwrap();
        assert!(!ws.is_open(MAP3).await);
    }

    #[tokio::test]
    async fn test_lagged_event_refreshes_open_replicas() {
        let hub = hub().await;
        let (a, _arx) = workspace(&hub, "a").await;
        let (b, _brx) = workspace(&hub, "b").await;

        for height in 2..=4 {
            a.submit(MAP3, vec![Patch::set(path!["height"], json!(height))], false)
                .await
                .unwrap();
        }
        // b never saw the pushes
        assert_eq!(b.document(MAP3).await.unwrap().version, 0);
        b.apply_event(&SyncEvent::Lagged(3)).await.unwrap();
        assert_eq!(b.document(MAP3).await, a.document(MAP3).await);
    }
}

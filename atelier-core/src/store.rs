//! Authoritative in-memory store of every live document.
//!
//! One table per [`ResourceKind`], each an id-indexed arena. Tree-shaped
//! documents reference their parent by id; traversal is a lookup, never a
//! pointer chase.
//!
//! Lifecycle per document:
//! ```text
//! create ──► live ──delete──► tombstoned ──undelete──► live
//!             │ ▲
//!        evict│ │restore          (evictable kinds only)
//!             ▼ │
//!           evicted
//! ```

use serde_json::Value;
use std::collections::HashMap;

use crate::document::{
    BinaryAsset, Document, DocumentKey, DocumentSummary, Ownership, ResourceKind, Residency,
};
use crate::error::SyncError;

#[derive(Debug, Default)]
struct Table {
    live: HashMap<u64, Document>,
    tombstones: HashMap<u64, Document>,
    /// Summaries of evicted documents, so listings stay complete.
    evicted: HashMap<u64, DocumentSummary>,
    next_id: u64,
}

impl Table {
    fn bump_next_id(&mut self, id: u64) {
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }
}

/// Residency of a key in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Live,
    Evicted,
    Deleted,
    Unknown,
}

/// Per-resource-kind map holding the canonical value of every live document.
#[derive(Debug, Default)]
pub struct AuthoritativeStore {
    tables: HashMap<ResourceKind, Table>,
}

impl AuthoritativeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: ResourceKind) -> Option<&Table> {
        self.tables.get(&kind)
    }

    fn table_mut(&mut self, kind: ResourceKind) -> &mut Table {
        self.tables.entry(kind).or_default()
    }

    /// Create a new live document and return a copy of it.
    ///
    /// Tree-shaped documents with a parent inherit the owner of their root.
    pub fn create(
        &mut self,
        kind: ResourceKind,
        owner: Ownership,
        parent: Option<u64>,
        value: Value,
        assets: Vec<BinaryAsset>,
    ) -> Result<Document, SyncError> {
        let owner = match parent {
            Some(_) if !kind.policy().tree_shaped => {
                return Err(SyncError::validation(format!("{kind} documents cannot have a parent")));
            }
            Some(parent_id) => {
                let parent_key = DocumentKey::new(kind, parent_id);
                if self.presence(parent_key) != Presence::Live {
                    return Err(SyncError::validation(format!(
                        "parent {parent_key} does not exist"
                    )));
                }
                self.owner_of(parent_key)?
            }
            None => owner,
        };

        let table = self.table_mut(kind);
        let id = table.next_id;
        table.next_id += 1;
        let mut doc = Document::new(DocumentKey::new(kind, id), owner, value);
        doc.parent = parent;
        doc.assets = assets;
        table.live.insert(id, doc.clone());
        log::debug!("created {} owned by {:?}", doc.key, doc.owner);
        Ok(doc)
    }

    /// Insert a document with a known key (recovery, restore from eviction).
    pub fn insert(&mut self, doc: Document) {
        let table = self.table_mut(doc.key.kind);
        table.bump_next_id(doc.key.id);
        table.evicted.remove(&doc.key.id);
        table.tombstones.remove(&doc.key.id);
        table.live.insert(doc.key.id, doc);
    }

    pub fn presence(&self, key: DocumentKey) -> Presence {
        match self.table(key.kind) {
            Some(t) if t.live.contains_key(&key.id) => Presence::Live,
            Some(t) if t.evicted.contains_key(&key.id) => Presence::Evicted,
            Some(t) if t.tombstones.contains_key(&key.id) => Presence::Deleted,
            _ => Presence::Unknown,
        }
    }

    pub fn get(&self, key: DocumentKey) -> Result<&Document, SyncError> {
        self.table(key.kind)
            .and_then(|t| t.live.get(&key.id))
            .ok_or(SyncError::NotFound(key))
    }

    pub fn get_mut(&mut self, key: DocumentKey) -> Result<&mut Document, SyncError> {
        self.tables
            .get_mut(&key.kind)
            .and_then(|t| t.live.get_mut(&key.id))
            .ok_or(SyncError::NotFound(key))
    }

    /// Tombstone a live document. Returns the removed document.
    pub fn delete(&mut self, key: DocumentKey) -> Result<Document, SyncError> {
        let table = self.tables.get_mut(&key.kind).ok_or(SyncError::NotFound(key))?;
        let doc = table.live.remove(&key.id).ok_or(SyncError::NotFound(key))?;
        table.tombstones.insert(key.id, doc.clone());
        Ok(doc)
    }

    /// A tombstoned document.
    pub fn get_deleted(&self, key: DocumentKey) -> Result<&Document, SyncError> {
        self.table(key.kind)
            .and_then(|t| t.tombstones.get(&key.id))
            .ok_or(SyncError::NotFound(key))
    }

    /// Bring a tombstoned document back to life.
    pub fn undelete(&mut self, key: DocumentKey) -> Result<Document, SyncError> {
        let table = self.tables.get_mut(&key.kind).ok_or(SyncError::NotFound(key))?;
        let doc = table.tombstones.remove(&key.id).ok_or(SyncError::NotFound(key))?;
        table.live.insert(key.id, doc.clone());
        Ok(doc)
    }

    /// Root of the ownership chain (the document itself for non-tree kinds).
    pub fn ownership_root(&self, key: DocumentKey) -> Result<DocumentKey, SyncError> {
        let mut current = self.get(key)?;
        let limit = self.table(key.kind).map_or(0, |t| t.live.len());
        for _ in 0..=limit {
            match current.parent {
                None => return Ok(current.key),
                Some(parent) => {
                    current = self.get(DocumentKey::new(key.kind, parent))?;
                }
            }
        }
        Err(SyncError::validation(format!("{key} has a cyclic parent chain")))
    }

    /// Owner of the document's ownership root.
    pub fn owner_of(&self, key: DocumentKey) -> Result<Ownership, SyncError> {
        let root = self.ownership_root(key)?;
        Ok(self.get(root)?.owner)
    }

    /// Ids of live documents whose parent is `key`.
    pub fn children(&self, key: DocumentKey) -> Vec<DocumentKey> {
        let mut children: Vec<DocumentKey> = self
            .table(key.kind)
            .map(|t| {
                t.live
                    .values()
                    .filter(|d| d.parent == Some(key.id))
                    .map(|d| d.key)
                    .collect()
            })
            .unwrap_or_default();
        children.sort();
        children
    }

    /// Summaries of live and evicted documents of `kind` accepted by
    /// `visible`, by id.
    pub fn list<F>(&self, kind: ResourceKind, visible: F) -> Vec<DocumentSummary>
    where
        F: Fn(&DocumentSummary) -> bool,
    {
        let mut list: Vec<DocumentSummary> = self
            .table(kind)
            .map(|t| {
                t.live
                    .values()
                    .map(Document::summary)
                    .chain(t.evicted.values().cloned())
                    .filter(|s| visible(s))
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by_key(|s| s.key);
        list
    }

    /// Drop an evictable document from memory and hand it to the caller for
    /// persistence. Resident kinds are never evicted.
    pub fn evict(&mut self, key: DocumentKey) -> Option<Document> {
        if key.kind.policy().residency != Residency::Evictable {
            return None;
        }
        let table = self.tables.get_mut(&key.kind)?;
        let doc = table.live.remove(&key.id)?;
        table.evicted.insert(key.id, doc.summary());
        log::debug!("evicted {key}");
        Some(doc)
    }

    /// Number of live documents across all kinds.
    pub fn live_count(&self) -> usize {
        self.tables.values().map(|t| t.live.len()).sum()
    }

    /// All live documents (for snapshots on shutdown).
    pub fn live_documents(&self) -> impl Iterator<Item = &Document> {
        self.tables.values().flat_map(|t| t.live.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TenantId;
    use serde_json::json;

    const TENANT: Ownership = Ownership::Tenant(TenantId(1));

    #[test]
    fn test_create_assigns_sequential_ids() {
        let mut store = AuthoritativeStore::new();
        let a = store.create(ResourceKind::Map, TENANT, None, json!({}), vec![]).unwrap();
        let b = store.create(ResourceKind::Map, TENANT, None, json!({}), vec![]).unwrap();
        let c = store.create(ResourceKind::Item, TENANT, None, json!({}), vec![]).unwrap();
        assert_eq!((a.key.id, b.key.id, c.key.id), (0, 1, 0));
        assert_eq!(store.live_count(), 3);
    }

    #[test]
    fn test_subtree_inherits_root_owner() {
        let mut store = AuthoritativeStore::new();
        let root = store
            .create(ResourceKind::ActionTree, TENANT, None, json!({"nodes": []}), vec![])
            .unwrap();
        let child = store
            .create(ResourceKind::ActionTree, Ownership::Global, Some(root.key.id), json!({}), vec![])
            .unwrap();
        let grandchild = store
            .create(ResourceKind::ActionTree, Ownership::Global, Some(child.key.id), json!({}), vec![])
            .unwrap();
        assert_eq!(grandchild.owner, TENANT);
        assert_eq!(store.ownership_root(grandchild.key).unwrap(), root.key);
        assert_eq!(store.children(root.key), vec![child.key]);
    }

    #[test]
    fn test_missing_parent_is_validation_error() {
        let mut store = AuthoritativeStore::new();
        let err = store
            .create(ResourceKind::ActionTree, TENANT, Some(42), json!({}), vec![])
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        let err = store
            .create(ResourceKind::Map, TENANT, Some(0), json!({}), vec![])
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_delete_and_undelete() {
        let mut store = AuthoritativeStore::new();
        let doc = store.create(ResourceKind::Item, TENANT, None, json!({"name": "Key"}), vec![]).unwrap();
        store.delete(doc.key).unwrap();
        assert_eq!(store.presence(doc.key), Presence::Deleted);
        assert_eq!(store.get_deleted(doc.key).unwrap(), &doc);
        assert_eq!(store.get(doc.key).unwrap_err(), SyncError::NotFound(doc.key));
        assert!(store.delete(doc.key).is_err());

        let restored = store.undelete(doc.key).unwrap();
        assert_eq!(restored, doc);
        assert_eq!(store.presence(doc.key), Presence::Live);
    }

    #[test]
    fn test_only_evictable_kinds_evict() {
        let mut store = AuthoritativeStore::new();
        let map = store.create(ResourceKind::Map, TENANT, None, json!({}), vec![]).unwrap();
        let item = store.create(ResourceKind::Item, TENANT, None, json!({}), vec![]).unwrap();

        assert!(store.evict(item.key).is_none());
        let evicted = store.evict(map.key).unwrap();
        assert_eq!(store.presence(map.key), Presence::Evicted);
        assert_eq!(store.list(ResourceKind::Map, |_| true), vec![map.summary()]);

        store.insert(evicted);
        assert_eq!(store.presence(map.key), Presence::Live);
    }

    #[test]
    fn test_insert_advances_next_id() {
        let mut store = AuthoritativeStore::new();
        store.insert(Document::new(DocumentKey::new(ResourceKind::Map, 9), TENANT, json!({})));
        let next = store.create(ResourceKind::Map, TENANT, None, json!({}), vec![]).unwrap();
        assert_eq!(next.key.id, 10);
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let mut store = AuthoritativeStore::new();
        let other = Ownership::Tenant(TenantId(2));
        store.create(ResourceKind::Map, TENANT, None, json!({"name": "A"}), vec![]).unwrap();
        store.create(ResourceKind::Map, other, None, json!({"name": "B"}), vec![]).unwrap();
        store.create(ResourceKind::Map, TENANT, None, json!({"name": "C"}), vec![]).unwrap();
        let names: Vec<_> = store
            .list(ResourceKind::Map, |d| d.owner == TENANT)
            .into_iter()
            .filter_map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["A", "C"]);
    }
}

//! Persistence integration tests: accepted batches and tombstones survive a
//! server restart on the same storage directory.

use std::sync::Arc;

use atelier_collab::broadcast::Frame;
use atelier_collab::hub::LocalTransport;
use atelier_collab::protocol::Hello;
use atelier_collab::server::{ServerConfig, SyncServer};
use atelier_collab::session::TokenTable;
use atelier_collab::storage::{DocumentStore, StoreConfig};
use atelier_collab::transport::Transport;
use atelier_core::{
    path, BinaryAsset, DocumentKey, Ownership, Patch, PatchBatch, Principal, Privilege, ResourceKind,
    SyncError, TenantId,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn tokens() -> TokenTable {
    TokenTable::new()
        .with_token("root", Principal::admin())
        .with_token("alice", Principal::tenant(Privilege::TenantAdmin, TenantId(1)))
}

fn server_at(dir: &TempDir) -> SyncServer {
    let config = ServerConfig {
        storage_path: Some(dir.path().to_path_buf()),
        ..ServerConfig::default()
    };
    SyncServer::new(config, Arc::new(tokens())).unwrap()
}

/// In-process session. Keep the receiver alive: a closed outbox cuts the
/// session off at the next push.
async fn session(server: &SyncServer, token: &str) -> (LocalTransport, mpsc::Receiver<Frame>) {
    LocalTransport::connect(server.hub().clone(), &Hello::new(token, Some(token.into()))).await
}

fn set(field: &str, from: serde_json::Value, to: serde_json::Value) -> PatchBatch {
    PatchBatch::new(vec![Patch::set(path![field], to)], vec![Patch::set(path![field], from)])
}

#[tokio::test]
async fn test_accepted_batches_survive_restart() {
    let dir = TempDir::new().unwrap();
    let key = {
        let server = server_at(&dir);
        let (alice, _alice_rx) = session(&server, "alice").await;
        let map = alice
            .create(ResourceKind::Map, None, None, json!({"name": "Quarry", "height": 1}), vec![])
            .await
            .unwrap();
        assert_eq!(map.owner, Ownership::Tenant(TenantId(1)));
        alice.submit_changes(map.key, set("height", json!(1), json!(2)), false).await.unwrap();
        alice.submit_changes(map.key, set("name", json!("Quarry"), json!("Pit")), false).await.unwrap();
        alice.disconnect().await;
        map.key
    };

    let server = server_at(&dir);
    let (alice, _alice_rx) = session(&server, "alice").await;
    let doc = alice.get(key).await.unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(doc.value, json!({"name": "Pit", "height": 2}));

    // the optimistic lock keeps working against the recovered version
    let err = alice
        .submit_changes(key, set("height", json!(1), json!(5)), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict { .. }));
}

#[tokio::test]
async fn test_tombstones_survive_restart() {
    let dir = TempDir::new().unwrap();
    let key = {
        let server = server_at(&dir);
        let (root, _root_rx) = session(&server, "root").await;
        let item = root
            .create(ResourceKind::Item, None, None, json!({"name": "Lantern"}), vec![])
            .await
            .unwrap();
        root.delete(item.key).await.unwrap();
        root.disconnect().await;
        item.key
    };

    let server = server_at(&dir);
    let (root, _root_rx) = session(&server, "root").await;
    assert_eq!(root.get(key).await, Err(SyncError::NotFound(key)));
    assert!(root.list(ResourceKind::Item).await.unwrap().is_empty());

    let restored = root.undelete(key).await.unwrap();
    assert_eq!(restored.value["name"], json!("Lantern"));
}

#[tokio::test]
async fn test_assets_are_stored_with_documents() {
    let dir = TempDir::new().unwrap();
    let (key, asset_id) = {
        let server = server_at(&dir);
        let (root, _root_rx) = session(&server, "root").await;
        let image = root
            .create(
                ResourceKind::Image,
                None,
                None,
                json!({"name": "portrait"}),
                vec![BinaryAsset::new("portrait.png", vec![0x89, b'P', b'N', b'G'])],
            )
            .await
            .unwrap();
        root.disconnect().await;
        (image.key, image.assets[0].id)
    };

    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let stored = store.load_document(key).unwrap();
    assert!(!stored.deleted);
    assert_eq!(stored.document.assets.len(), 1);
    assert_eq!(stored.document.assets[0].id, asset_id);
    assert_eq!(stored.document.assets[0].bytes, vec![0x89, b'P', b'N', b'G']);
}

#[tokio::test]
async fn test_idle_map_is_evicted_and_reloaded() {
    let dir = TempDir::new().unwrap();
    let server = server_at(&dir);
    let (alice, _alice_rx) = session(&server, "alice").await;
    let map = alice
        .create(ResourceKind::Map, None, None, json!({"name": "Mine", "height": 1}), vec![])
        .await
        .unwrap();
    let key: DocumentKey = map.key;

    alice.join_room(key).await.unwrap();
    alice.submit_changes(key, set("height", json!(1), json!(4)), false).await.unwrap();
    alice.leave_room(key).await.unwrap();
    assert_eq!(server.hub().stats().await.live_documents, 0);

    let listed = alice.list(ResourceKind::Map).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, key);

    let doc = alice.get(key).await.unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.value["height"], json!(4));
}

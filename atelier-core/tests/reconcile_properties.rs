//! Reconciler properties over a shared authoritative store.
//!
//! Verifies:
//! - Round-trip law for every operation kind
//! - Atomicity of refused all-or-nothing batches
//! - Per-patch independence of as-many-as-possible batches
//! - Access enforcement never mutates the store
//! - Out-of-range splices and malformed pairs are validation errors in
//!   both modes

use atelier_core::{
    apply_all_or_nothing, apply_as_many_as_possible, authorize, path, AuthoritativeStore, Ownership,
    Patch, PatchBatch, PerPatchResult, Principal, Privilege, ResourceKind, SyncError, TenantId,
};
use serde_json::{json, Value};

fn level() -> Value {
    json!({
        "name": "Cellar",
        "tiles": [{"height": 1}, {"height": 1}, {"height": 3}],
        "spawns": [{"enemy": "rat"}, {"enemy": "bat"}],
        "meta": {"music": "drip", "light": 0.4}
    })
}

fn patches() -> Vec<Patch> {
    vec![
        Patch::set(path!["tiles", 2usize, "height"], json!(0)),
        Patch::set(path!["meta", "fog"], json!(true)),
        Patch::insert(path!["spawns", 1usize], json!({"enemy": "ghost"})),
        Patch::remove(path!["spawns", 0usize]),
        Patch::splice(path!["tiles"], 0, 2, vec![json!({"height": 5})]),
        Patch::set(Vec::new(), json!({"replaced": true})),
    ]
}

#[test]
fn test_round_trip_law_holds_for_every_operation() {
    for patch in patches() {
        let original = level();
        let mut value = original.clone();
        let inverse = patch.apply(&mut value).unwrap();
        inverse.apply(&mut value).unwrap();
        assert_eq!(value, original, "round trip failed for {patch}");
    }
}

#[test]
fn test_accepted_inverses_restore_pre_state() {
    let mut store = AuthoritativeStore::new();
    let doc = store
        .create(ResourceKind::Map, Ownership::Tenant(TenantId(1)), None, level(), vec![])
        .unwrap();

    let mut local = doc.value.clone();
    let batch = PatchBatch::from_local(&mut local, patches()[..5].to_vec()).unwrap();

    let target = store.get_mut(doc.key).unwrap();
    apply_all_or_nothing(target, &batch).unwrap();
    assert_eq!(target.value, local);

    apply_all_or_nothing(target, &batch.inverted()).unwrap();
    assert_eq!(target.value, level());
}

#[test]
fn test_refused_batch_leaves_bytes_unchanged() {
    let mut store = AuthoritativeStore::new();
    let doc = store
        .create(ResourceKind::Map, Ownership::Tenant(TenantId(1)), None, level(), vec![])
        .unwrap();
    let before = serde_json::to_vec(&store.get(doc.key).unwrap().value).unwrap();

    let mut stale = level();
    stale["meta"]["music"] = json!("storm");
    let mut batch = PatchBatch::from_local(
        &mut stale,
        vec![
            Patch::set(path!["name"], json!("Crypt")),
            Patch::set(path!["meta", "music"], json!("silence")),
        ],
    )
    .unwrap();
    batch.patches.push(Patch::set(path!["meta", "light"], json!(1.0)));
    batch.inverse_patches.push(Patch::set(path!["meta", "light"], json!(0.4)));

    let err = apply_all_or_nothing(store.get_mut(doc.key).unwrap(), &batch).unwrap_err();
    assert_eq!(err, SyncError::Conflict { key: doc.key, index: 1 });

    let after = serde_json::to_vec(&store.get(doc.key).unwrap().value).unwrap();
    assert_eq!(before, after);
    assert_eq!(store.get(doc.key).unwrap().version, 0);
}

#[test]
fn test_as_many_as_possible_skips_only_conflicts() {
    let mut store = AuthoritativeStore::new();
    let doc = store
        .create(ResourceKind::Item, Ownership::Tenant(TenantId(1)), None, json!({"a": 1, "b": 2, "c": 3}), vec![])
        .unwrap();

    let batch = PatchBatch::new(
        vec![
            Patch::set(path!["a"], json!(10)),
            Patch::set(path!["b"], json!(20)),
            Patch::set(path!["c"], json!(30)),
        ],
        vec![
            Patch::set(path!["a"], json!(1)),
            Patch::set(path!["b"], json!(0)),
            Patch::set(path!["c"], json!(3)),
        ],
    );
    let outcome = apply_as_many_as_possible(store.get_mut(doc.key).unwrap(), &batch).unwrap();
    assert_eq!(
        outcome.results,
        [PerPatchResult::Success, PerPatchResult::Conflict, PerPatchResult::Success]
    );
    assert_eq!(store.get(doc.key).unwrap().value, json!({"a": 10, "b": 2, "c": 30}));
}

#[test]
fn test_denied_request_never_reaches_store() {
    let mut store = AuthoritativeStore::new();
    let doc = store
        .create(ResourceKind::Map, Ownership::Tenant(TenantId(1)), None, level(), vec![])
        .unwrap();
    let batch = PatchBatch::new(
        vec![Patch::set(path!["name"], json!("Stolen"))],
        vec![Patch::set(path!["name"], json!("Cellar"))],
    );

    for privilege in [
        Privilege::TenantAdmin,
        Privilege::TenantParticipant,
        Privilege::TenantPlayer,
        Privilege::None,
    ] {
        let intruder = Principal::tenant(privilege, TenantId(2));
        let owner = store.owner_of(doc.key).unwrap();
        let result = authorize(&intruder, "submit_changes", doc.key.kind, |t| owner == Ownership::Tenant(t))
            .and_then(|()| apply_all_or_nothing(store.get_mut(doc.key)?, &batch).map(|_| ()));
        assert!(matches!(result, Err(SyncError::Authorization { .. })));
    }
    assert_eq!(store.get(doc.key).unwrap().value, level());
}

fn item_store(value: Value) -> (AuthoritativeStore, atelier_core::DocumentKey) {
    let mut store = AuthoritativeStore::new();
    let doc = store
        .create(ResourceKind::Item, Ownership::Tenant(TenantId(1)), None, value, vec![])
        .unwrap();
    (store, doc.key)
}

#[test]
fn test_overflowing_splice_is_rejected() {
    let (mut store, key) = item_store(json!({"enemies": ["bat"]}));
    let batch = PatchBatch::new(
        vec![Patch::splice(path!["enemies"], usize::MAX, 1, vec![])],
        vec![Patch::splice(path!["enemies"], usize::MAX, 0, vec![json!("bat")])],
    );

    let err = apply_all_or_nothing(store.get_mut(key).unwrap(), &batch).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)), "got {err:?}");
    let err = apply_as_many_as_possible(store.get_mut(key).unwrap(), &batch).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)), "got {err:?}");
    assert_eq!(store.get(key).unwrap().value, json!({"enemies": ["bat"]}));
}

#[test]
fn test_splice_past_current_end_conflicts() {
    let (mut store, key) = item_store(json!({"enemies": ["bat"]}));
    let batch = PatchBatch::new(
        vec![Patch::splice(path!["enemies"], 1, 1, vec![])],
        vec![Patch::splice(path!["enemies"], 1, 0, vec![json!("rat")])],
    );
    let err = apply_all_or_nothing(store.get_mut(key).unwrap(), &batch).unwrap_err();
    assert_eq!(err, SyncError::Conflict { key, index: 0 });
}

#[test]
fn test_malformed_pair_is_validation_in_both_modes() {
    let (mut store, key) = item_store(json!({"a": 1, "b": 2}));
    let batch = PatchBatch::new(
        vec![
            Patch::set(path!["a"], json!(10)),
            Patch::insert(path!["b"], json!(20)),
        ],
        vec![
            Patch::set(path!["a"], json!(1)),
            Patch::set(path!["b"], json!(2)),
        ],
    );

    let err = apply_all_or_nothing(store.get_mut(key).unwrap(), &batch).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)), "got {err:?}");
    let err = apply_as_many_as_possible(store.get_mut(key).unwrap(), &batch).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)), "got {err:?}");

    // the valid first pair is not applied either
    let doc = store.get(key).unwrap();
    assert_eq!(doc.value, json!({"a": 1, "b": 2}));
    assert_eq!(doc.version, 0);
}

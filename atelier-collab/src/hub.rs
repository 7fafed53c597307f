//! Request handling core of the sync server.
//!
//! ```text
//! request ─► session lookup ─► load (if evicted) ─► authorize
//!                                                      │
//!                         reconcile against the AuthoritativeStore
//!                                                      │
//!                   persist batch ─► push to room (minus sender) ─► reply
//! ```
//!
//! Every request runs start to finish under one state lock, which holds the
//! store, the rooms and the sessions together. A push is therefore queued
//! before any later change to the same document is even looked at, and
//! membership never changes halfway through a fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use atelier_core::{
    apply_all_or_nothing, apply_as_many_as_possible, authorize, AuthoritativeStore, BinaryAsset,
    ChangeScope, Document, DocumentKey, Ownership, OwnershipMode, Patch, PatchBatch, Presence, Principal,
    ResourceKind, SyncError, TenantId,
};

use crate::broadcast::{BroadcastStats, Frame, Outbox, RoomId, RoomManager, SessionId};
use crate::protocol::{Hello, Push, Reply, Request, SyncMessage, Welcome};
use crate::server::ServerConfig;
use crate::session::{Authenticator, SessionRegistry};
use crate::storage::{DocumentStore, StoreError};
use crate::transport::Transport;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_sessions: usize,
    pub live_documents: usize,
    pub requests: u64,
    pub accepted_batches: u64,
    pub conflicts: u64,
    pub denials: u64,
    pub persisted_batches: u64,
    pub persisted_snapshots: u64,
    pub broadcast: BroadcastStats,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    requests: AtomicU64,
    accepted_batches: AtomicU64,
    conflicts: AtomicU64,
    denials: AtomicU64,
    persisted_batches: AtomicU64,
    persisted_snapshots: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct HubState {
    store: AuthoritativeStore,
    rooms: RoomManager,
    sessions: SessionRegistry,
}

/// Shared server core; one per process.
pub struct Hub {
    config: ServerConfig,
    state: Mutex<HubState>,
    authenticator: Arc<dyn Authenticator>,
    persistence: Option<Arc<DocumentStore>>,
    counters: Counters,
}

/// Room receiving change pushes for `key`.
fn change_room(key: DocumentKey, owner: Ownership) -> RoomId {
    match key.kind.policy().change_scope {
        ChangeScope::MapRoom => RoomId::Map(key.id),
        ChangeScope::OwnerRoom => owner_room(owner),
        ChangeScope::Global => RoomId::Global,
    }
}

/// Room receiving list updates for documents of `kind` owned by `owner`.
fn list_room(kind: ResourceKind, owner: Ownership) -> RoomId {
    match kind.policy().ownership {
        OwnershipMode::SharedAsset => RoomId::Global,
        OwnershipMode::TenantOwned => owner_room(owner),
    }
}

fn owner_room(owner: Ownership) -> RoomId {
    match owner {
        Ownership::Tenant(t) => RoomId::Tenant(t),
        Ownership::Global => RoomId::Global,
    }
}

/// Whether tenant `t` owns a document of `kind` owned by `owner`.
fn tenant_owns(kind: ResourceKind, owner: Ownership, t: TenantId) -> bool {
    kind.policy().ownership == OwnershipMode::TenantOwned && owner == Ownership::Tenant(t)
}

impl Hub {
    /// In-memory hub without persistence.
    pub fn new(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            state: Mutex::new(HubState::default()),
            authenticator,
            persistence: None,
            counters: Counters::default(),
        }
    }

    /// Hub backed by `persistence`; every stored document is recovered.
    ///
    /// Evictable documents are only registered and load on first use.
    pub fn with_storage(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        persistence: Arc<DocumentStore>,
    ) -> Result<Self, StoreError> {
        let mut state = HubState::default();
        let recovered = persistence.recover_all()?;
        let total = recovered.len();
        for stored in recovered {
            let key = stored.document.key;
            state.store.insert(stored.document);
            if stored.deleted {
                let _ = state.store.delete(key);
            } else if config.evict_idle_maps {
                state.store.evict(key);
            }
        }
        log::info!("recovered {total} documents from {}", persistence.path().display());

        Ok(Self {
            config,
            state: Mutex::new(state),
            authenticator,
            persistence: Some(persistence),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn persistence(&self) -> Option<&Arc<DocumentStore>> {
        self.persistence.as_ref()
    }

    /// Insert a document directly, bypassing access control. Used to seed
    /// content from administrative tooling.
    pub async fn insert(&self, doc: Document) {
        let mut state = self.state.lock().await;
        self.persist_snapshot(&doc);
        state.store.insert(doc);
    }

    /// Current authoritative copy of a live document.
    pub async fn document(&self, key: DocumentKey) -> Option<Document> {
        self.state.lock().await.store.get(key).ok().cloned()
    }

    pub async fn presence(&self, key: DocumentKey) -> Presence {
        self.state.lock().await.store.presence(key)
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Register a new session and its outbox.
    pub async fn connect(&self, hello: &Hello, outbox: Outbox) -> Welcome {
        let principal = self.authenticator.authenticate(hello);
        let mut state = self.state.lock().await;
        let session = state.sessions.register(hello, principal).id;
        state.rooms.connect(session, outbox);
        if let Some(tenant) = principal.tenant {
            state.rooms.join(RoomId::Tenant(tenant), session);
        }
        Counters::bump(&self.counters.total_connections);
        log::info!(
            "session {session} connected: {} ({}) as {:?}",
            hello.name,
            hello.client_id,
            principal.privilege
        );
        Welcome {
            session_id: session,
            principal,
        }
    }

    /// Remove a session from every room. Idempotent.
    pub async fn disconnect(&self, session: SessionId) {
        let mut state = self.state.lock().await;
        self.disconnect_locked(&mut state, session);
        self.reap(&mut state);
    }

    fn disconnect_locked(&self, state: &mut HubState, session: SessionId) {
        let left = state.rooms.disconnect(session);
        if state.sessions.remove(session).is_none() {
            return;
        }
        log::info!("session {session} disconnected");
        for room in left {
            if let RoomId::Map(id) = room {
                self.evict_if_idle(state, id);
            }
        }
    }

    /// Disconnect sessions whose outbox was dropped during fan-out.
    fn reap(&self, state: &mut HubState) {
        loop {
            let cut_off = state.rooms.take_cut_off();
            if cut_off.is_empty() {
                return;
            }
            for session in cut_off {
                self.disconnect_locked(state, session);
            }
        }
    }

    fn principal(state: &HubState, session: SessionId) -> Result<Principal, SyncError> {
        state
            .sessions
            .get(session)
            .map(|s| s.principal)
            .ok_or_else(|| SyncError::transport(format!("session {session} is not connected")))
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Open a map for a session. A previously open map is closed first.
    pub async fn join_room(&self, session: SessionId, key: DocumentKey) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let principal = Self::principal(&state, session)?;
        if key.kind != ResourceKind::Map {
            return Err(SyncError::validation(format!("{} documents have no room", key.kind)));
        }
        self.ensure_loaded(&mut state, key)?;
        let owner = state.store.owner_of(key)?;
        if !principal.can_read(owner) {
            self.deny_read(&principal, "open", key.kind);
            return Err(SyncError::Authorization {
                operation: "open".into(),
                kind: key.kind,
            });
        }

        let room = RoomId::Map(key.id);
        if state.rooms.is_member(room, session) {
            return Ok(());
        }
        if state.sessions.viewers_of(key.id) >= self.config.max_sessions_per_map {
            return Err(SyncError::validation(format!("{key} has too many open sessions")));
        }

        let previous = state.sessions.get(session).and_then(|s| s.open_map);
        if let Some(previous) = previous {
            state.rooms.leave(RoomId::Map(previous), session);
            self.evict_if_idle(&mut state, previous);
        }
        state.rooms.join(room, session);
        if let Some(s) = state.sessions.get_mut(session) {
            s.open_map = Some(key.id);
        }
        log::debug!("session {session} opened {key}");
        Ok(())
    }

    /// Close a map for a session.
    pub async fn leave_room(&self, session: SessionId, key: DocumentKey) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        Self::principal(&state, session)?;
        if !state.rooms.leave(RoomId::Map(key.id), session) {
            return Ok(());
        }
        if let Some(s) = state.sessions.get_mut(session) {
            if s.open_map == Some(key.id) {
                s.open_map = None;
            }
        }
        log::debug!("session {session} closed {key}");
        self.evict_if_idle(&mut state, key.id);
        Ok(())
    }

    // ─── Requests ─────────────────────────────────────────────────────

    /// Handle one request to completion. Never fails: errors become
    /// [`Reply::Error`].
    pub async fn handle(&self, session: SessionId, request: Request) -> Reply {
        self.process(session, request, None).await
    }

    /// Handle a request and queue the reply on the session's outbox, behind
    /// every push queued before it.
    pub async fn handle_and_reply(&self, session: SessionId, request_id: u64, request: Request) {
        self.process(session, request, Some(request_id)).await;
    }

    /// Queue an error reply for a request that could not be decoded.
    pub async fn reject(&self, session: SessionId, request_id: u64, error: SyncError) {
        let mut state = self.state.lock().await;
        match SyncMessage::reply(request_id, &Reply::error(error)) {
            Ok(msg) => {
                if let Err(e) = state.rooms.send_to(session, &msg) {
                    log::error!("failed to queue rejection for session {session}: {e}");
                }
            }
            Err(e) => log::error!("failed to encode rejection for session {session}: {e}"),
        }
        self.reap(&mut state);
    }

    async fn process(&self, session: SessionId, request: Request, reply_to: Option<u64>) -> Reply {
        Counters::bump(&self.counters.requests);
        let operation = request.name();
        // Maps loaded without an open room must not stay resident.
        let touched = match &request {
            Request::SubmitChanges { key, .. } | Request::Get { key } if key.kind == ResourceKind::Map => Some(key.id),
            _ => None,
        };
        let mut state = self.state.lock().await;
        let reply = match self.dispatch(&mut state, session, request) {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    SyncError::Conflict { .. } => Counters::bump(&self.counters.conflicts),
                    SyncError::Authorization { .. } => Counters::bump(&self.counters.denials),
                    _ => {}
                }
                log::debug!("session {session} {operation} failed: {e}");
                Reply::error(e)
            }
        };
        if let Some(request_id) = reply_to {
            match SyncMessage::reply(request_id, &reply) {
                Ok(msg) => {
                    if let Err(e) = state.rooms.send_to(session, &msg) {
                        log::error!("failed to queue reply for session {session}: {e}");
                    }
                }
                Err(e) => log::error!("failed to encode reply for session {session}: {e}"),
            }
        }
        if let Some(map_id) = touched {
            self.evict_if_idle(&mut state, map_id);
        }
        self.reap(&mut state);
        reply
    }

    fn dispatch(&self, state: &mut HubState, session: SessionId, request: Request) -> Result<Reply, SyncError> {
        let principal = Self::principal(state, session)?;
        match request {
            Request::SubmitChanges {
                key,
                batch,
                execute_as_many_as_possible,
            } => self.submit_changes(state, session, &principal, key, &batch, execute_as_many_as_possible),
            Request::Create {
                kind,
                tenant,
                parent,
                snapshot,
                assets,
            } => self.create(state, session, &principal, kind, tenant, parent, snapshot, assets),
            Request::Delete { key } => self.delete(state, session, &principal, key),
            Request::Undelete { key } => self.undelete(state, session, &principal, key),
            Request::Get { key } => self.get(state, &principal, key),
            Request::List { kind } => Ok(Reply::List {
                kind,
                items: state.store.list(kind, |s| principal.can_read(s.owner)),
            }),
        }
    }

    fn submit_changes(
        &self,
        state: &mut HubState,
        session: SessionId,
        principal: &Principal,
        key: DocumentKey,
        batch: &PatchBatch,
        as_many_as_possible: bool,
    ) -> Result<Reply, SyncError> {
        self.ensure_loaded(state, key)?;
        let owner = state.store.owner_of(key)?;
        authorize(principal, "submit_changes", key.kind, |t| tenant_owns(key.kind, owner, t))?;

        // Reconcile a working copy; the store only sees it once the batch
        // is durable.
        let mut working = state.store.get(key)?.clone();
        let (reply, version, patches) = if as_many_as_possible {
            let outcome = apply_as_many_as_possible(&mut working, batch)?;
            let reply = Reply::PerPatch {
                version: outcome.version,
                results: outcome.results,
            };
            (reply, outcome.version, outcome.applied.patches)
        } else {
            let applied = apply_all_or_nothing(&mut working, batch)?;
            (Reply::Ack { version: applied.version }, applied.version, applied.patches)
        };

        if !patches.is_empty() {
            self.persist_batch(key, version, &patches)?;
            *state.store.get_mut(key)? = working;
            Counters::bump(&self.counters.accepted_batches);
            let push = SyncMessage::push(&Push::Changed { key, version, patches })?;
            let queued = state.rooms.broadcast(change_room(key, owner), &push, Some(session))?;
            log::debug!("{key} v{version} from session {session} pushed to {queued} sessions");
        }
        Ok(reply)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        state: &mut HubState,
        session: SessionId,
        principal: &Principal,
        kind: ResourceKind,
        tenant: Option<TenantId>,
        parent: Option<u64>,
        snapshot: Value,
        assets: Vec<BinaryAsset>,
    ) -> Result<Reply, SyncError> {
        if !snapshot.is_object() {
            return Err(SyncError::validation("snapshot must be a JSON object"));
        }
        let policy = kind.policy();
        let owner = match (policy.ownership, parent) {
            (OwnershipMode::SharedAsset, None) => Ownership::Global,
            (_, Some(parent_id)) => {
                let parent_key = DocumentKey::new(kind, parent_id);
                if !policy.tree_shaped || state.store.presence(parent_key) != Presence::Live {
                    return Err(SyncError::validation(format!("{parent_key} is not a valid parent")));
                }
                state.store.owner_of(parent_key)?
            }
            (OwnershipMode::TenantOwned, None) => match tenant.or(principal.tenant) {
                Some(t) => Ownership::Tenant(t),
                None => Ownership::Global,
            },
        };
        authorize(principal, "create", kind, |t| tenant_owns(kind, owner, t))?;

        // Asset ids are always minted here.
        let assets = assets
            .into_iter()
            .map(|a| BinaryAsset {
                id: Uuid::new_v4(),
                ..a
            })
            .collect();
        let document = state.store.create(kind, owner, parent, snapshot, assets)?;
        self.persist_snapshot(&document);
        log::info!("session {session} created {} for {:?}", document.key, owner);

        let push = SyncMessage::push(&Push::Created {
            document: document.clone(),
        })?;
        state.rooms.broadcast(list_room(kind, owner), &push, Some(session))?;
        self.push_list(state, kind, owner)?;
        Ok(Reply::Snapshot { document })
    }

    fn delete(
        &self,
        state: &mut HubState,
        session: SessionId,
        principal: &Principal,
        key: DocumentKey,
    ) -> Result<Reply, SyncError> {
        self.ensure_loaded(state, key)?;
        let owner = state.store.owner_of(key)?;
        authorize(principal, "delete", key.kind, |t| tenant_owns(key.kind, owner, t))?;
        if !state.store.children(key).is_empty() {
            return Err(SyncError::validation(format!("{key} still has children")));
        }

        let document = state.store.delete(key)?;
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.set_deleted(key, true) {
                log::error!("failed to persist deletion of {key}: {e}");
            }
        }
        log::info!("session {session} deleted {key}");

        let push = SyncMessage::push(&Push::Deleted { key })?;
        let room = change_room(key, owner);
        state.rooms.broadcast(room, &push, Some(session))?;
        if let RoomId::Map(_) = room {
            self.close_map_room(state, key)?;
        }
        self.push_list(state, key.kind, owner)?;
        Ok(Reply::Ack {
            version: document.version,
        })
    }

    /// Remove every viewer from a deleted map's room.
    fn close_map_room(&self, state: &mut HubState, key: DocumentKey) -> Result<(), SyncError> {
        let closed = SyncMessage::push(&Push::RoomClosed { key })?;
        for member in state.rooms.close(RoomId::Map(key.id)) {
            if let Some(s) = state.sessions.get_mut(member) {
                s.open_map = None;
            }
            state.rooms.send_to(member, &closed)?;
        }
        Ok(())
    }

    fn undelete(
        &self,
        state: &mut HubState,
        session: SessionId,
        principal: &Principal,
        key: DocumentKey,
    ) -> Result<Reply, SyncError> {
        if state.store.presence(key) == Presence::Evicted {
            // Loading restores the tombstone.
            let _ = self.ensure_loaded(state, key);
        }
        let owner = state.store.get_deleted(key)?.owner;
        authorize(principal, "undelete", key.kind, |t| tenant_owns(key.kind, owner, t))?;
        if let Some(parent) = state.store.get_deleted(key)?.parent {
            let parent_key = DocumentKey::new(key.kind, parent);
            if state.store.presence(parent_key) != Presence::Live {
                return Err(SyncError::validation(format!("parent {parent_key} is deleted")));
            }
        }

        let document = state.store.undelete(key)?;
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.set_deleted(key, false) {
                log::error!("failed to persist undeletion of {key}: {e}");
            }
        }
        log::info!("session {session} restored {key}");

        let push = SyncMessage::push(&Push::Created {
            document: document.clone(),
        })?;
        state.rooms.broadcast(list_room(key.kind, owner), &push, Some(session))?;
        self.push_list(state, key.kind, owner)?;
        Ok(Reply::Snapshot { document })
    }

    fn get(&self, state: &mut HubState, principal: &Principal, key: DocumentKey) -> Result<Reply, SyncError> {
        self.ensure_loaded(state, key)?;
        let owner = state.store.owner_of(key)?;
        if !principal.can_read(owner) {
            self.deny_read(principal, "read", key.kind);
            return Err(SyncError::Authorization {
                operation: "read".into(),
                kind: key.kind,
            });
        }
        Ok(Reply::Snapshot {
            document: state.store.get(key)?.clone(),
        })
    }

    fn deny_read(&self, principal: &Principal, operation: &str, kind: ResourceKind) {
        log::warn!(
            target: "atelier::access",
            "denied {operation} on {kind} for {:?} (tenant {:?})",
            principal.privilege,
            principal.tenant
        );
    }

    /// Refresh resource lists of everyone who can see `owner`'s documents.
    fn push_list(&self, state: &mut HubState, kind: ResourceKind, owner: Ownership) -> Result<(), SyncError> {
        let items = state.store.list(kind, |s| s.owner == owner);
        let push = SyncMessage::push(&Push::ListUpdated { kind, owner, items })?;
        state.rooms.broadcast(list_room(kind, owner), &push, None)?;
        Ok(())
    }

    // ─── Residency ────────────────────────────────────────────────────

    /// Bring an evicted document back into memory.
    fn ensure_loaded(&self, state: &mut HubState, key: DocumentKey) -> Result<(), SyncError> {
        match state.store.presence(key) {
            Presence::Live => Ok(()),
            Presence::Deleted | Presence::Unknown => Err(SyncError::NotFound(key)),
            Presence::Evicted => {
                let Some(persistence) = &self.persistence else {
                    return Err(SyncError::NotFound(key));
                };
                let stored = persistence.load_document(key).map_err(|e| {
                    log::error!("failed to load {key}: {e}");
                    SyncError::NotFound(key)
                })?;
                log::debug!("loaded {key} v{}", stored.document.version);
                state.store.insert(stored.document);
                if stored.deleted {
                    state.store.delete(key)?;
                    return Err(SyncError::NotFound(key));
                }
                Ok(())
            }
        }
    }

    /// Snapshot and unload a map nobody has open.
    fn evict_if_idle(&self, state: &mut HubState, map_id: u64) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if !self.config.evict_idle_maps || !state.rooms.is_empty(RoomId::Map(map_id)) {
            return;
        }
        let key = DocumentKey::new(ResourceKind::Map, map_id);
        let Some(doc) = state.store.evict(key) else {
            return;
        };
        match persistence.save_snapshot(&doc) {
            Ok(_) => {
                Counters::bump(&self.counters.persisted_snapshots);
                log::info!("evicted idle {key} at v{}", doc.version);
            }
            Err(e) => {
                log::error!("failed to snapshot {key}, keeping it resident: {e}");
                state.store.insert(doc);
            }
        }
    }

    fn persist_batch(&self, key: DocumentKey, version: u64, patches: &[Patch]) -> Result<(), SyncError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        match persistence.append_batch(key, version, patches) {
            Ok(_) => {
                Counters::bump(&self.counters.persisted_batches);
                Ok(())
            }
            Err(e) => {
                log::error!("failed to persist {key} v{version}, batch dropped: {e}");
                Err(SyncError::transport(format!("storage unavailable for {key}")))
            }
        }
    }

    fn persist_snapshot(&self, doc: &Document) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match persistence.save_snapshot(doc) {
            Ok(_) => Counters::bump(&self.counters.persisted_snapshots),
            Err(e) => log::error!("failed to persist {}: {e}", doc.key),
        }
    }

    /// Snapshot every live document (shutdown).
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let state = self.state.lock().await;
        let mut count = 0;
        for doc in state.store.live_documents() {
            persistence.save_snapshot(doc)?;
            count += 1;
        }
        persistence.sync()?;
        log::info!("flushed {count} documents");
        Ok(count)
    }

    pub async fn stats(&self) -> ServerStats {
        let state = self.state.lock().await;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStats {
            total_connections: load(&self.counters.total_connections),
            active_sessions: state.sessions.len(),
            live_documents: state.store.live_count(),
            requests: load(&self.counters.requests),
            accepted_batches: load(&self.counters.accepted_batches),
            conflicts: load(&self.counters.conflicts),
            denials: load(&self.counters.denials),
            persisted_batches: load(&self.counters.persisted_batches),
            persisted_snapshots: load(&self.counters.persisted_snapshots),
            broadcast: state.rooms.stats(),
        }
    }
}

/// In-process connection to a [`Hub`].
pub struct LocalTransport {
    hub: Arc<Hub>,
    welcome: Welcome,
}

impl LocalTransport {
    /// Connect a new session. Pushes arrive on the returned receiver as
    /// encoded [`SyncMessage`] frames.
    pub async fn connect(hub: Arc<Hub>, hello: &Hello) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(hub.config.outbox_capacity);
        let welcome = hub.connect(hello, tx).await;
        (Self { hub, welcome }, rx)
    }

    pub fn session_id(&self) -> SessionId {
        self.welcome.session_id
    }

    pub fn principal(&self) -> Principal {
        self.welcome.principal
    }

    pub async fn disconnect(&self) {
        self.hub.disconnect(self.welcome.session_id).await;
    }
}

impl Transport for LocalTransport {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Reply, SyncError>> {
        Box::pin(async move { self.hub.handle(self.welcome.session_id, request).await.into_result() })
    }

    fn join_room(&self, key: DocumentKey) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(self.hub.join_room(self.welcome.session_id, key))
    }

    fn leave_room(&self, key: DocumentKey) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(self.hub.leave_room(self.welcome.session_id, key))
    }
}

//! Connected sessions and connection-time authentication.

use std::collections::HashMap;
use uuid::Uuid;

use atelier_core::{Principal, Privilege, TenantId};

use crate::broadcast::SessionId;
use crate::protocol::Hello;

/// Resolves the credentials presented in [`Hello`] to a principal.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, hello: &Hello) -> Principal;
}

/// Static token table, typically loaded from `ATELIER_TOKENS`.
///
/// Unknown or missing tokens authenticate as [`Principal::ANONYMOUS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenTable {
    tokens: HashMap<String, Principal>,
}

/// Malformed token table entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid token entry {entry:?}: {reason}")]
pub struct TokenParseError {
    pub entry: String,
    pub reason: &'static str,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    /// Parse `token=privilege[:tenant]` entries separated by commas.
    ///
    /// ```
    /// # use atelier_collab::session::TokenTable;
    /// let table = TokenTable::parse("root=admin, t1=tenant_admin:4").unwrap();
    /// assert_eq!(table.len(), 2);
    /// ```
    pub fn parse(list: &str) -> Result<Self, TokenParseError> {
        let mut table = Self::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let err = |reason| TokenParseError {
                entry: entry.to_string(),
                reason,
            };
            let (token, grant) = entry.split_once('=').ok_or_else(|| err("missing '='"))?;
            let (privilege, tenant) = match grant.split_once(':') {
                Some((p, t)) => (p, Some(t)),
                None => (grant, None),
            };
            let privilege = Privilege::parse(privilege.trim()).ok_or_else(|| err("unknown privilege"))?;
            let tenant = tenant
                .map(|t| t.trim().parse::<u64>().map(TenantId))
                .transpose()
                .map_err(|_| err("tenant is not a number"))?;
            let principal = match (privilege, tenant) {
                (Privilege::Admin, _) => Principal { privilege, tenant },
                (Privilege::None, None) => Principal::ANONYMOUS,
                (_, Some(tenant)) => Principal::tenant(privilege, tenant),
                (_, None) => return Err(err("tenant privileges need a tenant")),
            };
            table.tokens.insert(token.trim().to_string(), principal);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenTable {
    fn authenticate(&self, hello: &Hello) -> Principal {
        hello
            .token
            .as_deref()
            .and_then(|t| self.tokens.get(t))
            .copied()
            .unwrap_or(Principal::ANONYMOUS)
    }
}

/// State the server keeps per connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub client_id: Uuid,
    pub name: String,
    pub principal: Principal,
    /// Map the session currently has open, if any.
    pub open_map: Option<u64>,
}

/// Live sessions by id. Ids are never reused within a process.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hello: &Hello, principal: Principal) -> &Session {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.entry(id).or_insert(Session {
            id,
            client_id: hello.client_id,
            name: hello.name.clone(),
            principal,
            open_map: None,
        })
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions that have `map` open.
    pub fn viewers_of(&self, map: u64) -> usize {
        self.sessions.values().filter(|s| s.open_map == Some(map)).count()
    }
}

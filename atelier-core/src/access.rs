//! Access control gate.
//!
//! Runs once per request, before the reconciler; the reconciler never
//! re-derives rights. Denials are logged on the `atelier::access` target.

use serde::{Deserialize, Serialize};

use crate::document::{Ownership, ResourceKind, TenantId};
use crate::error::SyncError;

/// Privilege level of a connected user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    Admin,
    TenantAdmin,
    TenantParticipant,
    /// Play-only access.
    TenantPlayer,
    None,
}

impl Privilege {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Privilege::Admin),
            "tenant_admin" => Some(Privilege::TenantAdmin),
            "tenant_participant" => Some(Privilege::TenantParticipant),
            "tenant_player" => Some(Privilege::TenantPlayer),
            "none" => Some(Privilege::None),
            _ => None,
        }
    }
}

/// Identity a session carries after connection-time authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub privilege: Privilege,
    pub tenant: Option<TenantId>,
}

impl Principal {
    pub const ANONYMOUS: Principal = Principal {
        privilege: Privilege::None,
        tenant: None,
    };

    pub fn admin() -> Self {
        Self {
            privilege: Privilege::Admin,
            tenant: None,
        }
    }

    pub fn tenant(privilege: Privilege, tenant: TenantId) -> Self {
        Self {
            privilege,
            tenant: Some(tenant),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.privilege == Privilege::Admin
    }

    /// Whether this principal may see a document with the given owner.
    pub fn can_read(&self, owner: Ownership) -> bool {
        match owner {
            Ownership::Global => true,
            Ownership::Tenant(t) => self.is_admin() || self.tenant == Some(t),
        }
    }
}

/// Allow or deny a mutation of a resource of `kind`.
///
/// `owns` answers "does this tenant own the target resource"; it is only
/// consulted for tenant-scoped privileges.
pub fn authorize<F>(principal: &Principal, operation: &str, kind: ResourceKind, owns: F) -> Result<(), SyncError>
where
    F: FnOnce(TenantId) -> bool,
{
    let allowed = match principal.privilege {
        Privilege::Admin => true,
        Privilege::TenantAdmin | Privilege::TenantParticipant => principal.tenant.is_some_and(owns),
        Privilege::TenantPlayer | Privilege::None => false,
    };
    if allowed {
        return Ok(());
    }
    log::warn!(
        target: "atelier::access",
        "denied {operation} on {kind} for {:?} (tenant {:?})",
        principal.privilege,
        principal.tenant
    );
    Err(SyncError::Authorization {
        operation: operation.to_string(),
        kind,
    })
}

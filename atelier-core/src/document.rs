//! Document model: resource kinds, identities, ownership and the per-kind
//! policy table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Ownership scope partitioning resources among authoring groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tenant#{}", self.0)
    }
}

/// Kinds of editable documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ActionTree,
    Map,
    TileAsset,
    Animation,
    Character,
    Item,
    Image,
}

/// Who may own a document of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipMode {
    /// Owned by a tenant (or by the global scope when an admin creates it
    /// without a tenant).
    TenantOwned,
    /// Admin-managed shared asset without an ownership concept.
    SharedAsset,
}

/// Where accepted changes of a document are broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeScope {
    /// The room of the open document itself.
    MapRoom,
    /// The owner's tenant room, or every session for global documents.
    OwnerRoom,
    /// Every connected session.
    Global,
}

/// Whether a live document may be dropped from memory while nobody is
/// interested in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Evictable,
    Resident,
}

/// Per-kind behavior, resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    pub ownership: OwnershipMode,
    pub change_scope: ChangeScope,
    pub residency: Residency,
    /// Documents of this kind may have a parent of the same kind; rights
    /// are gated by the root.
    pub tree_shaped: bool,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::ActionTree,
        ResourceKind::Map,
        ResourceKind::TileAsset,
        ResourceKind::Animation,
        ResourceKind::Character,
        ResourceKind::Item,
        ResourceKind::Image,
    ];

    pub fn policy(self) -> KindPolicy {
        use ChangeScope::*;
        use OwnershipMode::*;
        use Residency::*;
        match self {
            ResourceKind::Map => KindPolicy {
                ownership: TenantOwned,
                change_scope: MapRoom,
                residency: Evictable,
                tree_shaped: false,
            },
            ResourceKind::ActionTree => KindPolicy {
                ownership: TenantOwned,
                change_scope: OwnerRoom,
                residency: Resident,
                tree_shaped: true,
            },
            ResourceKind::Item | ResourceKind::Image => KindPolicy {
                ownership: TenantOwned,
                change_scope: OwnerRoom,
                residency: Resident,
                tree_shaped: false,
            },
            ResourceKind::TileAsset | ResourceKind::Animation | ResourceKind::Character => {
                KindPolicy {
                    ownership: SharedAsset,
                    change_scope: Global,
                    residency: Resident,
                    tree_shaped: false,
                }
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ActionTree => "action_tree",
            ResourceKind::Map => "map",
            ResourceKind::TileAsset => "tile_asset",
            ResourceKind::Animation => "animation",
            ResourceKind::Character => "character",
            ResourceKind::Item => "item",
            ResourceKind::Image => "image",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a document: its kind plus a per-kind numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub kind: ResourceKind,
    pub id: u64,
}

impl DocumentKey {
    pub const fn new(kind: ResourceKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Owner of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Global,
    Tenant(TenantId),
}

impl Ownership {
    pub fn tenant(self) -> Option<TenantId> {
        match self {
            Ownership::Global => None,
            Ownership::Tenant(t) => Some(t),
        }
    }
}

/// Binary payload uploaded together with a document (image data, tile
/// sheets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryAsset {
    pub id: Uuid,
    pub name: String,
    pub bytes: Vec<u8>,
}

impl BinaryAsset {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            bytes,
        }
    }
}

/// An editable aggregate with a single authoritative value while live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: DocumentKey,
    pub owner: Ownership,
    /// Parent document of the same kind (tree-shaped kinds only).
    pub parent: Option<u64>,
    /// Number of accepted patch batches since creation.
    pub version: u64,
    pub value: Value,
    #[serde(default)]
    pub assets: Vec<BinaryAsset>,
}

impl Document {
    pub fn new(key: DocumentKey, owner: Ownership, value: Value) -> Self {
        Self {
            key,
            owner,
            parent: None,
            version: 0,
            value,
            assets: Vec::new(),
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            key: self.key,
            owner: self.owner,
            name: self
                .value
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            version: self.version,
        }
    }
}

/// Lightweight listing entry for resource lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub key: DocumentKey,
    pub owner: Ownership,
    pub name: Option<String>,
    pub version: u64,
}

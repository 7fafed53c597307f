//! # atelier-core: document synchronization core for Atelier
//!
//! Synchronous building blocks shared by the server and the client:
//!
//! ```text
//!  client edit ──► Patch + inverse ──► PatchBatch
//!                                          │
//!                          access::authorize (once per request)
//!                                          │
//!                                          ▼
//!                  reconciler::apply_all_or_nothing / apply_as_many_as_possible
//!                                          │
//!                                          ▼
//!                              AuthoritativeStore (per-kind arena)
//! ```
//!
//! ## Modules
//!
//! - [`patch`]: structural patches over `serde_json::Value` with inverses
//! - [`reconciler`]: optimistic-lock precondition check and application
//! - [`store`]: authoritative per-kind document tables
//! - [`access`]: privilege / ownership gate
//! - [`document`]: resource kinds, keys, ownership, per-kind policy
//! - [`error`]: request error taxonomy

pub mod access;
pub mod document;
pub mod error;
pub mod patch;
pub mod reconciler;
pub mod store;

pub use access::{authorize, Principal, Privilege};
pub use document::{
    BinaryAsset, ChangeScope, Document, DocumentKey, DocumentSummary, KindPolicy, Ownership,
    OwnershipMode, Residency, ResourceKind, TenantId,
};
pub use error::{ErrorCode, ErrorReply, PatchError, SyncError};
pub use patch::{Patch, Path, PathSegment};
pub use reconciler::{
    apply_all_or_nothing, apply_as_many_as_possible, Applied, PartiallyApplied, PatchBatch,
    PerPatchResult,
};
pub use store::{AuthoritativeStore, Presence};

//! Patch reconciler: optimistic-lock conflict detection and application.
//!
//! Every forward patch travels with its inverse. Before a forward patch is
//! applied, the value currently at its path must be exactly what the inverse
//! would restore. That proves the client computed the patch against the same
//! state the server holds at that path.
//!
//! Precondition granularity is the value at the patch's own path: ancestors
//! and siblings are not compared, so edits to different leaves of the same
//! object never conflict with each other.
//!
//! Pairs are checked sequentially against the evolving value: pair `i` sees
//! the state produced by pairs `0..i` of the same batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, DocumentKey};
use crate::error::{PatchError, SyncError};
use crate::patch::{apply_all, get_at, Patch, PathSegment};

/// Forward patches plus their matching inverses, submitted atomically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatchBatch {
    pub patches: Vec<Patch>,
    pub inverse_patches: Vec<Patch>,
}

impl PatchBatch {
    pub fn new(patches: Vec<Patch>, inverse_patches: Vec<Patch>) -> Self {
        Self {
            patches,
            inverse_patches,
        }
    }

    /// Batch that undoes this one: the inverses become the forward patches
    /// (last applied first) and vice versa.
    pub fn inverted(&self) -> Self {
        Self {
            patches: self.inverse_patches.iter().rev().cloned().collect(),
            inverse_patches: self.patches.iter().rev().cloned().collect(),
        }
    }

    /// Apply `patches` to a local value (optimistically) and pair each one
    /// with the inverse computed from the pre-state.
    ///
    /// On failure the value is left untouched.
    pub fn from_local(value: &mut Value, patches: Vec<Patch>) -> Result<Self, PatchError> {
        let mut inverses = apply_all(value, &patches)?;
        inverses.reverse();
        Ok(Self::new(patches, inverses))
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    fn pairs(&self) -> impl Iterator<Item = (&Patch, &Patch)> {
        self.patches.iter().zip(self.inverse_patches.iter())
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.patches.len() != self.inverse_patches.len() {
            return Err(SyncError::validation(format!(
                "{} patches but {} inverse patches",
                self.patches.len(),
                self.inverse_patches.len()
            )));
        }
        Ok(())
    }
}

/// Outcome of one patch of an as-many-as-possible batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerPatchResult {
    Success,
    Conflict,
}

/// Accepted all-or-nothing batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub version: u64,
    pub patches: Vec<Patch>,
}

/// Result of an as-many-as-possible batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PartiallyApplied {
    pub version: u64,
    pub results: Vec<PerPatchResult>,
    /// Forward patches that were applied, in input order.
    pub applied: PatchBatch,
}

impl PartiallyApplied {
    pub fn any_applied(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Why a single pair was refused.
#[derive(Debug, Clone, PartialEq)]
enum Refusal {
    Conflict,
    Invalid(String),
}

/// Apply every pair or none of them.
///
/// The batch is applied to a working copy; the document is only replaced
/// once every pair passed, so a refused batch leaves it untouched.
pub fn apply_all_or_nothing(doc: &mut Document, batch: &PatchBatch) -> Result<Applied, SyncError> {
    batch.validate()?;
    let mut working = doc.value.clone();
    for (index, (patch, inverse)) in batch.pairs().enumerate() {
        reconcile_pair(&mut working, patch, inverse).map_err(|r| refusal_error(doc.key, index, r))?;
    }
    doc.value = working;
    if !batch.is_empty() {
        doc.version += 1;
    }
    log::debug!("{} accepted {} patches (v{})", doc.key, batch.len(), doc.version);
    Ok(Applied {
        version: doc.version,
        patches: batch.patches.clone(),
    })
}

/// Evaluate each pair independently, in input order, applying the ones whose
/// precondition holds against the current value.
///
/// A malformed batch or pair fails the whole request with a validation
/// error and leaves the document untouched; only conflicts are per patch.
pub fn apply_as_many_as_possible(
    doc: &mut Document,
    batch: &PatchBatch,
) -> Result<PartiallyApplied, SyncError> {
    batch.validate()?;
    let mut working = doc.value.clone();
    let mut results = Vec::with_capacity(batch.len());
    let mut applied = PatchBatch::default();
    for (index, (patch, inverse)) in batch.pairs().enumerate() {
        match reconcile_pair(&mut working, patch, inverse) {
            Ok(()) => {
                results.push(PerPatchResult::Success);
                applied.patches.push(patch.clone());
                applied.inverse_patches.push(inverse.clone());
            }
            Err(Refusal::Conflict) => {
                log::debug!("{}: patch #{index} conflicts", doc.key);
                results.push(PerPatchResult::Conflict);
            }
            Err(invalid) => return Err(refusal_error(doc.key, index, invalid)),
        }
    }
    doc.value = working;
    if !applied.is_empty() {
        doc.version += 1;
    }
    Ok(PartiallyApplied {
        version: doc.version,
        results,
        applied,
    })
}

fn refusal_error(key: DocumentKey, index: usize, refusal: Refusal) -> SyncError {
    match refusal {
        Refusal::Conflict => SyncError::Conflict { key, index },
        Refusal::Invalid(msg) => SyncError::validation(format!("{key} patch #{index}: {msg}")),
    }
}

/// Check the precondition of one pair, then apply the forward patch.
/// `value` is only modified on success.
fn reconcile_pair(value: &mut Value, patch: &Patch, inverse: &Patch) -> Result<(), Refusal> {
    check_precondition(value, patch, inverse)?;
    patch
        .apply(value)
        .map(|_| ())
        .map_err(|e| Refusal::Invalid(format!("{patch}: {e}")))
}

fn check_precondition(value: &Value, patch: &Patch, inverse: &Patch) -> Result<(), Refusal> {
    if patch.path() != inverse.path() {
        return Err(Refusal::Invalid(format!(
            "inverse {inverse} does not target the path of {patch}"
        )));
    }
    let path = patch.path();
    match (patch, inverse) {
        // Overwrite of an existing value: it must still hold the old value.
        (Patch::Set { .. }, Patch::Set { value: expected, .. })
        | (Patch::Remove { .. }, Patch::Insert { value: expected, .. }) => {
            expect_value(value, path, expected)
        }
        // Creation of a new object key or array slot.
        (Patch::Set { .. }, Patch::Remove { .. }) => match parent_of(value, path)? {
            Value::Object(_) if get_at(value, path).is_none() => Ok(()),
            Value::Object(_) => Err(Refusal::Conflict),
            _ => Err(Refusal::Invalid("set can only create object keys".into())),
        },
        (Patch::Insert { .. }, Patch::Remove { .. }) => match parent_of(value, path)? {
            Value::Object(_) if get_at(value, path).is_none() => Ok(()),
            Value::Array(arr) if index_of(path)? <= arr.len() => Ok(()),
            _ => Err(Refusal::Conflict),
        },
        (
            Patch::Splice {
                start,
                delete_count,
                items,
                ..
            },
            Patch::Splice {
                start: inv_start,
                delete_count: inv_delete_count,
                items: removed,
                ..
            },
        ) => {
            if start != inv_start || *delete_count != removed.len() || *inv_delete_count != items.len() {
                return Err(Refusal::Invalid("splice inverse does not mirror the splice".into()));
            }
            match get_at(value, path) {
                Some(Value::Array(arr)) => {
                    let end = start
                        .checked_add(*delete_count)
                        .ok_or_else(|| Refusal::Invalid("splice range overflows".into()))?;
                    // A range past the end means the array shrank since the
                    // client computed the splice.
                    if end <= arr.len() && arr[*start..end] == removed[..] {
                        Ok(())
                    } else {
                        Err(Refusal::Conflict)
                    }
                }
                _ => Err(Refusal::Conflict),
            }
        }
        _ => Err(Refusal::Invalid(format!(
            "{} cannot be inverted by {}",
            patch.op_name(),
            inverse.op_name()
        ))),
    }
}

fn expect_value(value: &Value, path: &[PathSegment], expected: &Value) -> Result<(), Refusal> {
    match get_at(value, path) {
        Some(current) if current == expected => Ok(()),
        _ => Err(Refusal::Conflict),
    }
}

fn parent_of<'a>(value: &'a Value, path: &[PathSegment]) -> Result<&'a Value, Refusal> {
    let (_, parent) = path
        .split_last()
        .ok_or_else(|| Refusal::Invalid("operation needs a non-empty path".into()))?;
    get_at(value, parent).ok_or(Refusal::Conflict)
}

fn index_of(path: &[PathSegment]) -> Result<usize, Refusal> {
    match path.last() {
        Some(PathSegment::Index(i)) => Ok(*i),
        Some(PathSegment::Key(k)) => k
            .parse()
            .map_err(|_| Refusal::Invalid(format!("{k} is not an array index"))),
        None => Err(Refusal::Invalid("operation needs a non-empty path".into())),
    }
}

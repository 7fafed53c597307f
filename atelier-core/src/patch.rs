//! Patches: atomic structural changes of a JSON document value.
//!
//! A [`Patch`] names a target path and one of four operations. Applying a
//! patch returns its inverse, computed from the pre-state, so that
//! `apply(apply(v, p), p⁻¹) == v` holds for every successfully applied patch.
//!
//! Wire shape (JSON):
//! ```text
//! { "op": "set",    "path": ["tiles", 3, "height"], "value": 2 }
//! { "op": "insert", "path": ["enemies", 0],         "value": {...} }
//! { "op": "remove", "path": ["enemies", 0] }
//! { "op": "splice", "path": ["layers"], "start": 1, "delete_count": 2, "items": [...] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::PatchError;

/// One step of a path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Key(k) => f.write_str(k),
        }
    }
}

/// Ordered list of keys/indices from the document root.
pub type Path = Vec<PathSegment>;

/// Build a [`Path`] from keys and `usize` indices.
///
/// ```
/// use atelier_core::path;
/// let p = path!["tiles", 3usize, "height"];
/// assert_eq!(p.len(), 3);
/// ```
#[macro_export]
macro_rules! path {
    ($($seg:expr),* $(,)?) => {
        vec![$($crate::patch::PathSegment::from($seg)),*]
    };
}

/// Render a path as `/a/3/b` for logs.
pub fn display_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|s| format!("/{s}")).collect()
}

/// A single structural change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Patch {
    /// Replace the value at `path`, or add a new object key.
    Set { path: Path, value: Value },
    /// Insert into an array at `path`'s index, or add an absent object key.
    Insert { path: Path, value: Value },
    /// Remove the array element or object key at `path`.
    Remove { path: Path },
    /// Replace `delete_count` elements of the array at `path` starting at
    /// `start` with `items`.
    Splice {
        path: Path,
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    },
}

impl Patch {
    pub fn set(path: Path, value: Value) -> Self {
        Patch::Set { path, value }
    }

    pub fn insert(path: Path, value: Value) -> Self {
        Patch::Insert { path, value }
    }

    pub fn remove(path: Path) -> Self {
        Patch::Remove { path }
    }

    pub fn splice(path: Path, start: usize, delete_count: usize, items: Vec<Value>) -> Self {
        Patch::Splice {
            path,
            start,
            delete_count,
            items,
        }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            Patch::Set { path, .. }
            | Patch::Insert { path, .. }
            | Patch::Remove { path }
            | Patch::Splice { path, .. } => path,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Patch::Set { .. } => "set",
            Patch::Insert { .. } => "insert",
            Patch::Remove { .. } => "remove",
            Patch::Splice { .. } => "splice",
        }
    }

    /// Apply this patch to `doc` and return the patch that undoes it.
    ///
    /// On error `doc` is left untouched.
    pub fn apply(&self, doc: &mut Value) -> Result<Patch, PatchError> {
        match self {
            Patch::Set { path, value } => apply_set(doc, path, value.clone()),
            Patch::Insert { path, value } => apply_insert(doc, path, value.clone()),
            Patch::Remove { path } => apply_remove(doc, path),
            Patch::Splice {
                path,
                start,
                delete_count,
                items,
            } => apply_splice(doc, path, *start, *delete_count, items.clone()),
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op_name(), display_path(self.path()))
    }
}

/// Apply patches in order, returning their inverses in the order they must
/// be applied to revert (last applied first).
///
/// Stops at the first failure after reverting what was already applied.
pub fn apply_all(doc: &mut Value, patches: &[Patch]) -> Result<Vec<Patch>, PatchError> {
    let mut inverses = Vec::with_capacity(patches.len());
    for patch in patches {
        match patch.apply(doc) {
            Ok(inverse) => inverses.push(inverse),
            Err(e) => {
                for inverse in inverses.iter().rev() {
                    // Inverses of just-applied patches always apply.
                    let _ = inverse.apply(doc);
                }
                return Err(e);
            }
        }
    }
    inverses.reverse();
    Ok(inverses)
}

// ── Path navigation ───────────────────────────────────────────────────────

fn array_index(seg: &PathSegment) -> Result<usize, PatchError> {
    match seg {
        PathSegment::Index(i) => Ok(*i),
        PathSegment::Key(k) => k.parse().map_err(|_| PatchError::InvalidIndex),
    }
}

fn object_key(seg: &PathSegment) -> String {
    match seg {
        PathSegment::Index(i) => i.to_string(),
        PathSegment::Key(k) => k.clone(),
    }
}

fn child<'a>(value: &'a Value, seg: &PathSegment) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(&object_key(seg)),
        Value::Array(arr) => arr.get(array_index(seg).ok()?),
        _ => None,
    }
}

fn child_mut<'a>(value: &'a mut Value, seg: &PathSegment) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(&object_key(seg)),
        Value::Array(arr) => arr.get_mut(array_index(seg).ok()?),
        _ => None,
    }
}

/// Value at `path`, if the path resolves.
pub fn get_at<'a>(doc: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(doc, child)
}

fn get_mut_at<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for seg in path {
        current = child_mut(current, seg).ok_or(PatchError::NotFound)?;
    }
    Ok(current)
}

fn split_last(path: &[PathSegment]) -> Result<(&[PathSegment], &PathSegment), PatchError> {
    match path.split_last() {
        Some((last, parent)) => Ok((parent, last)),
        None => Err(PatchError::EmptyPath),
    }
}

// ── Operation applicators ────────────────────────────────────────────────

fn apply_set(doc: &mut Value, path: &[PathSegment], value: Value) -> Result<Patch, PatchError> {
    if path.is_empty() {
        let old = std::mem::replace(doc, value);
        return Ok(Patch::set(Vec::new(), old));
    }
    let (parent_path, last) = split_last(path)?;
    match get_mut_at(doc, parent_path)? {
        Value::Object(map) => match map.insert(object_key(last), value) {
            Some(old) => Ok(Patch::set(path.to_vec(), old)),
            None => Ok(Patch::remove(path.to_vec())),
        },
        Value::Array(arr) => {
            let idx = array_index(last)?;
            let slot = arr.get_mut(idx).ok_or(PatchError::InvalidIndex)?;
            let old = std::mem::replace(slot, value);
            Ok(Patch::set(path.to_vec(), old))
        }
        _ => Err(PatchError::InvalidTarget),
    }
}

fn apply_insert(doc: &mut Value, path: &[PathSegment], value: Value) -> Result<Patch, PatchError> {
    let (parent_path, last) = split_last(path)?;
    match get_mut_at(doc, parent_path)? {
        Value::Object(map) => {
            let key = object_key(last);
            if map.contains_key(&key) {
                return Err(PatchError::KeyExists);
            }
            map.insert(key, value);
        }
        Value::Array(arr) => {
            let idx = array_index(last)?;
            if idx > arr.len() {
                return Err(PatchError::InvalidIndex);
            }
            arr.insert(idx, value);
        }
        _ => return Err(PatchError::InvalidTarget),
    }
    Ok(Patch::remove(path.to_vec()))
}

fn apply_remove(doc: &mut Value, path: &[PathSegment]) -> Result<Patch, PatchError> {
    let (parent_path, last) = split_last(path)?;
    let old = match get_mut_at(doc, parent_path)? {
        Value::Object(map) => map.remove(&object_key(last)).ok_or(PatchError::NotFound)?,
        Value::Array(arr) => {
            let idx = array_index(last)?;
            if idx >= arr.len() {
                return Err(PatchError::InvalidIndex);
            }
            arr.remove(idx)
        }
        _ => return Err(PatchError::InvalidTarget),
    };
    Ok(Patch::insert(path.to_vec(), old))
}

fn apply_splice(
    doc: &mut Value,
    path: &[PathSegment],
    start: usize,
    delete_count: usize,
    items: Vec<Value>,
) -> Result<Patch, PatchError> {
    let arr = match get_mut_at(doc, path)? {
        Value::Array(arr) => arr,
        _ => return Err(PatchError::InvalidTarget),
    };
    let end = start.checked_add(delete_count).ok_or(PatchError::InvalidIndex)?;
    if end > arr.len() {
        return Err(PatchError::InvalidIndex);
    }
    let inserted = items.len();
    let removed: Vec<Value> = arr.splice(start..end, items).collect();
    Ok(Patch::splice(path.to_vec(), start, inserted, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "name": "Harbor",
            "tiles": [
                {"height": 0}, {"height": 0}, {"height": 0}, {"height": 1}
            ],
            "enemies": ["bat", "slime"]
        })
    }

    fn assert_round_trip(patch: Patch) {
        let original = sample();
        let mut doc = original.clone();
        let inverse = patch.apply(&mut doc).unwrap();
        assert_ne!(doc, original, "{patch} should change the document");
        inverse.apply(&mut doc).unwrap();
        assert_eq!(doc, original, "inverse of {patch} should restore the document");
    }

    #[test]
    fn test_set_existing_leaf() {
        let mut doc = sample();
        let inverse = Patch::set(path!["tiles", 3usize, "height"], json!(2))
            .apply(&mut doc)
            .unwrap();
        assert_eq!(doc["tiles"][3]["height"], json!(2));
        assert_eq!(inverse, Patch::set(path!["tiles", 3usize, "height"], json!(1)));
    }

    #[test]
    fn test_set_new_key_inverts_to_remove() {
        let mut doc = sample();
        let inverse = Patch::set(path!["music"], json!("calm")).apply(&mut doc).unwrap();
        assert_eq!(inverse, Patch::remove(path!["music"]));
    }

    #[test]
    fn test_round_trip_law() {
        assert_round_trip(Patch::set(path!["tiles", 3usize, "height"], json!(2)));
        assert_round_trip(Patch::set(path!["weather"], json!("rain")));
        assert_round_trip(Patch::set(Vec::new(), json!({"empty": true})));
        assert_round_trip(Patch::insert(path!["enemies", 1usize], json!("ghost")));
        assert_round_trip(Patch::insert(path!["enemies", 2usize], json!("ghost")));
        assert_round_trip(Patch::insert(path!["author"], json!("kim")));
        assert_round_trip(Patch::remove(path!["enemies", 0usize]));
        assert_round_trip(Patch::remove(path!["name"]));
        assert_round_trip(Patch::splice(path!["tiles"], 1, 2, vec![json!({"height": 9})]));
        assert_round_trip(Patch::splice(path!["enemies"], 2, 0, vec![json!("orc"), json!("elf")]));
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let mut doc = sample();
        let err = Patch::insert(path!["enemies", 5usize], json!("x")).apply(&mut doc);
        assert_eq!(err, Err(PatchError::InvalidIndex));
        assert_eq!(doc, sample());
    }

    #[test]
    fn test_insert_existing_key_rejected() {
        let mut doc = sample();
        let err = Patch::insert(path!["name"], json!("x")).apply(&mut doc);
        assert_eq!(err, Err(PatchError::KeyExists));
    }

    #[test]
    fn test_remove_missing() {
        let mut doc = sample();
        assert_eq!(
            Patch::remove(path!["missing"]).apply(&mut doc),
            Err(PatchError::NotFound)
        );
        assert_eq!(
            Patch::remove(Vec::new()).apply(&mut doc),
            Err(PatchError::EmptyPath)
        );
    }

    #[test]
    fn test_splice_bounds_checked() {
        let mut doc = sample();
        let err = Patch::splice(path!["enemies"], 1, 5, vec![]).apply(&mut doc);
        assert_eq!(err, Err(PatchError::InvalidIndex));
        let err = Patch::splice(path!["name"], 0, 0, vec![]).apply(&mut doc);
        assert_eq!(err, Err(PatchError::InvalidTarget));
    }

    #[test]
    fn test_apply_all_reverts_on_failure() {
        let mut doc = sample();
        let patches = vec![
            Patch::set(path!["name"], json!("Docks")),
            Patch::remove(path!["enemies", 9usize]),
        ];
        assert!(apply_all(&mut doc, &patches).is_err());
        assert_eq!(doc, sample());
    }

    #[test]
    fn test_apply_all_inverses_revert_in_order() {
        let mut doc = sample();
        let patches = vec![
            Patch::insert(path!["enemies", 0usize], json!("ghost")),
            Patch::set(path!["enemies", 0usize], json!("wraith")),
        ];
        let inverses = apply_all(&mut doc, &patches).unwrap();
        assert_eq!(doc["enemies"], json!(["wraith", "bat", "slime"]));
        apply_all(&mut doc, &inverses).unwrap();
        assert_eq!(doc, sample());
    }

    #[test]
    fn test_wire_shape() {
        let patch: Patch = serde_json::from_value(json!({
            "op": "set", "path": ["tiles", 3, "height"], "value": 2
        }))
        .unwrap();
        assert_eq!(patch, Patch::set(path!["tiles", 3usize, "height"], json!(2)));
        assert_eq!(patch.to_string(), "set /tiles/3/height");
    }

    #[test]
    fn test_get_at() {
        let doc = sample();
        assert_eq!(get_at(&doc, &path!["tiles", 3usize, "height"]), Some(&json!(1)));
        assert_eq!(get_at(&doc, &path!["tiles", 7usize]), None);
        assert_eq!(get_at(&doc, &[]), Some(&doc));
    }
}

//! Minimal patch computation: snapshot, mutate, diff.
//!
//! The diff is a two-way merge-patch document (removed keys become `null`,
//! arrays and scalars are replaced wholesale). Applying it to the original
//! serialized form reproduces the modified form byte-for-byte, which is the
//! guarantee the remote apply path relies on.

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Outcome of one patch computation: both serialized forms, the difference
/// document, and the mutated object itself.
#[derive(Debug)]
pub struct ComputedPatch {
    pub original: Vec<u8>,
    pub modified: Vec<u8>,
    pub patch: Vec<u8>,
    pub object: Value,
}

/// Snapshot `object`, run the mutation, and diff the serialized forms.
///
/// The mutation failure is propagated as-is; no patch is produced in that
/// case. Encoding uses serde_json on both sides of the diff, so the minimal
/// patch guarantee holds.
pub fn compute_patch<F, E>(object: &Value, mutate: F) -> Result<ComputedPatch>
where
    F: FnOnce(&Value) -> Result<Value, E>,
    E: Into<anyhow::Error>,
{
    let original = serde_json::to_vec(object).context("encoding original object")?;
    let mutated = mutate(object).map_err(Into::into)?;
    let modified = serde_json::to_vec(&mutated).context("encoding mutated object")?;

    // Reparse from the serialized forms so the diff sees exactly what the
    // wire would carry. A failure here is an internal invariant violation
    // but is surfaced rather than swallowed.
    let before: Value = serde_json::from_slice(&original).context("reparsing original form")?;
    let after: Value = serde_json::from_slice(&modified).context("reparsing modified form")?;
    let patch_doc = merge_diff(&before, &after);
    let patch = serde_json::to_vec(&patch_doc).context("encoding patch document")?;

    Ok(ComputedPatch { original, modified, patch, object: mutated })
}

/// Compute the minimal merge-patch document turning `before` into `after`.
pub fn merge_diff(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut out = Map::new();
            for (k, av) in a {
                match b.get(k) {
                    Some(bv) if bv == av => {}
                    Some(bv) => {
                        out.insert(k.clone(), merge_diff(bv, av));
                    }
                    None => {
                        out.insert(k.clone(), av.clone());
                    }
                }
            }
            for k in b.keys() {
                if !a.contains_key(k) {
                    out.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(out)
        }
        _ => after.clone(),
    }
}

/// Apply a merge-patch document (RFC 7386 semantics: `null` deletes).
pub fn apply_merge_patch(base: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(pm) => {
            let mut out = base.as_object().cloned().unwrap_or_default();
            for (k, pv) in pm {
                if pv.is_null() {
                    out.remove(k);
                } else {
                    let merged = apply_merge_patch(out.get(k).unwrap_or(&Value::Null), pv);
                    out.insert(k.clone(), merged);
                }
            }
            Value::Object(out)
        }
        _ => patch.clone(),
    }
}

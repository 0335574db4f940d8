//! Recursive merge-patch engine
//!
//! This is the general "apply an overlay" primitive used both for status
//! updates and for user-supplied storage overrides layered onto generated
//! manifests. It mutates the base document in place:
//!
//! - mappings merge recursively, keys only in the patch are inserted, keys
//!   only in the base are untouched
//! - sequences of mappings merge element-wise by their mandatory `name`
//!   field: matched elements merge recursively, unmatched patch elements are
//!   appended at the end
//! - an empty base sequence, or a sequence containing any non-mapping
//!   element on either side, is replaced by the patch sequence wholesale
//! - a mapping or sequence patched onto a scalar (or vice versa) is a
//!   [`Error::ShapeMismatch`]
//!
//! Errors identify the offending path; on error the base may be partially
//! modified, so callers treat merge failures as fatal to the whole operation.

use serde_json::map::Entry;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Merge `patch` into `base` in place
///
/// Both `base` and `patch` must be JSON objects at the top level.
pub fn merge_patch(base: &mut Value, patch: &Value) -> Result<()> {
    let patch_map = patch.as_object().ok_or_else(|| Error::ShapeMismatch {
        path: "(root)".to_string(),
    })?;
    let base_map = base.as_object_mut().ok_or_else(|| Error::ShapeMismatch {
        path: "(root)".to_string(),
    })?;
    merge_objects(base_map, patch_map, "")
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn merge_objects(
    base: &mut Map<String, Value>,
    patch: &Map<String, Value>,
    prefix: &str,
) -> Result<()> {
    for (key, pv) in patch {
        let path = child_path(prefix, key);
        match base.entry(key.clone()) {
            // Key only in patch: inserted as-is, no recursion.
            Entry::Vacant(slot) => {
                slot.insert(pv.clone());
            }
            Entry::Occupied(mut slot) => merge_existing(slot.get_mut(), pv, &path)?,
        }
    }
    Ok(())
}

fn merge_existing(bv: &mut Value, pv: &Value, path: &str) -> Result<()> {
    match bv {
        Value::Null => {
            *bv = pv.clone();
            Ok(())
        }
        Value::Object(base_map) => {
            let patch_map = pv.as_object().ok_or_else(|| Error::ShapeMismatch {
                path: path.to_string(),
            })?;
            merge_objects(base_map, patch_map, path)
        }
        Value::Array(bs) => {
            let ps = pv.as_array().ok_or_else(|| Error::ShapeMismatch {
                path: path.to_string(),
            })?;
            merge_sequences(bs, ps, path)
        }
        // Scalar in base: a structured patch value is a shape error, a
        // scalar patch value replaces it.
        _ => {
            if pv.is_object() || pv.is_array() {
                return Err(Error::ShapeMismatch {
                    path: path.to_string(),
                });
            }
            *bv = pv.clone();
            Ok(())
        }
    }
}

fn merge_sequences(base: &mut Vec<Value>, patch: &[Value], path: &str) -> Result<()> {
    let all_mappings =
        base.iter().all(Value::is_object) && patch.iter().all(Value::is_object);
    if base.is_empty() || !all_mappings {
        *base = patch.to_vec();
        return Ok(());
    }

    for (idx, elem) in patch.iter().enumerate() {
        let elem_path = format!("{path}[{idx}]");
        let name = named_key(elem).ok_or(Error::MissingKeyField {
            path: elem_path.clone(),
        })?;
        match base
            .iter_mut()
            .find(|b| named_key(b).as_deref() == Some(name.as_str()))
        {
            Some(matched) => merge_existing(matched, elem, &elem_path)?,
            None => base.push(elem.clone()),
        }
    }
    Ok(())
}

/// The non-empty `name` field of a mapping element, if present
fn named_key(elem: &Value) -> Option<String> {
    match elem.get("name") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

//! JSON-patch validation, reversible application, and diffing.
//!
//! Patches arrive wrapped in an info envelope identifying the sending
//! application; [`validate`] checks the envelope and rejects operations
//! touching guarded paths. [`apply`] applies an RFC 6902 patch and returns
//! the inverse patch alongside the new document, so every content change
//! can be stored as a revertible revision.

use json_patch::Patch;
use serde_json::Value as JsonValue;

use crate::error::{StoreError, StoreResult};

/// Paths no patch may touch, regardless of target.
pub const BASE_GUARDS: &[&str] = &["/key", "/kind"];

/// Additional guards for file metadata patches.
pub const FILE_META_GUARDS: &[&str] = &[
    "/key",
    "/kind",
    "/owner",
    "/permissions",
    "/permissionIds",
    "/parents",
];

/// A validated patch envelope.
#[derive(Debug, Clone)]
pub struct PatchInfo {
    /// Identifier of the sending application.
    pub app: String,
    /// Version of the sending application.
    pub app_version: String,
    /// Client-generated id of this patch exchange, echoed in events.
    pub id: String,
    pub patch: Patch,
}

fn required_string(info: &JsonValue, field: &str) -> StoreResult<String> {
    match info.get(field) {
        Some(JsonValue::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(StoreError::invalid_patch(format!(
            "missing or invalid \"{field}\""
        ))),
    }
}

/// Validate a patch envelope against the base guarded paths.
pub fn validate(info: &JsonValue) -> StoreResult<PatchInfo> {
    validate_with_guards(info, BASE_GUARDS)
}

/// Validate a patch envelope against a caller-supplied guard set.
///
/// Fails with `InvalidPatch` when `app`, `appVersion`, `id`, or `patch` is
/// missing or malformed, or when any operation path (including a move
/// `from`) lands on or under a guarded path.
pub fn validate_with_guards(info: &JsonValue, guards: &[&str]) -> StoreResult<PatchInfo> {
    let app = required_string(info, "app")?;
    let app_version = required_string(info, "appVersion")?;
    let id = required_string(info, "id")?;
    let patch_value = info
        .get("patch")
        .ok_or_else(|| StoreError::invalid_patch("missing \"patch\""))?;
    if !patch_value.is_array() {
        return Err(StoreError::invalid_patch("\"patch\" is not an array"));
    }
    check_guards(patch_value, guards)?;
    let patch: Patch = serde_json::from_value(patch_value.clone())
        .map_err(|e| StoreError::invalid_patch(format!("malformed patch: {e}")))?;
    Ok(PatchInfo {
        app,
        app_version,
        id,
        patch,
    })
}

fn guarded(path: &str, guards: &[&str]) -> bool {
    guards
        .iter()
        .any(|guard| path == *guard || path.starts_with(&format!("{guard}/")))
}

fn check_guards(patch_value: &JsonValue, guards: &[&str]) -> StoreResult<()> {
    let ops = patch_value.as_array().expect("checked by caller");
    for op in ops {
        for field in ["path", "from"] {
            if let Some(path) = op.get(field).and_then(JsonValue::as_str) {
                if guarded(path, guards) {
                    return Err(StoreError::invalid_patch(format!(
                        "patch touches a guarded path: {path}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Apply a patch, returning the new document and the inverse patch.
///
/// Applying the returned revert to the new document restores the input.
pub fn apply(doc: &JsonValue, patch: &Patch) -> StoreResult<(JsonValue, Patch)> {
    let mut patched = doc.clone();
    json_patch::patch(&mut patched, &patch.0)
        .map_err(|e| StoreError::invalid_patch(e.to_string()))?;
    let revert = json_patch::diff(&patched, doc);
    Ok((patched, revert))
}

/// The patch transforming `a` into `b`.
///
/// Used to compute metadata deltas after content changes, for fan-out.
pub fn diff(a: &JsonValue, b: &JsonValue) -> Patch {
    json_patch::diff(a, b)
}

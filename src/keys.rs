//! Deterministic key construction for every entity family.
//!
//! Keys are byte-ordered strings. `~` is the reserved separator; no
//! component may contain it, which makes every composite key unambiguous
//! and lets a prefix ending in `~` bound an iteration range. Time-prefixed
//! families order chronologically so `reverse: true` iteration returns
//! newest first.
//!
//! Canonical forms:
//!
//! - Space / file: `<key>`
//! - Legacy nested project: `~<spaceKey>~<projectKey>~`
//! - App project: `~app~<appId>~user~<userKey>~project~<projectKey>`
//! - App request: `~app~<appId>~user~<userKey>~request~<requestKey>`
//! - History data: `~history~<isoTime>~<userKey>~`
//! - History index: `~history~<tag>~<isoTime>~<scopeKey>~<userKey>~`
//! - Revision: `~<kind>~<parentKey>~<creationMillis>~`
//! - Shared link: `~shared~<userKey>~<fileKey>`
//! - Bin: `~deleted~<kind>~<originalKey>`

use crate::error::{StoreError, StoreResult};

/// The reserved separator.
pub const SEPARATOR: char = '~';

/// Width the creation millis are padded to inside revision keys, so byte
/// order equals numeric order.
const MILLIS_WIDTH: usize = 16;

/// Validate a single key component.
///
/// Components must be non-empty and must not contain the separator.
pub fn validate_component(value: &str) -> StoreResult<()> {
    if value.is_empty() {
        return Err(StoreError::invalid("empty key component"));
    }
    if value.contains(SEPARATOR) {
        return Err(StoreError::invalid(format!(
            "key component \"{value}\" contains the reserved \"~\" character"
        )));
    }
    Ok(())
}

/// The `[gte, lte]` pair bounding every key under `prefix`.
///
/// Works because components never contain `~`, so `prefix + "~"` sorts
/// after every real continuation of the prefix.
pub fn prefix_range(prefix: &str) -> (String, String) {
    (prefix.to_string(), format!("{prefix}~"))
}

/// Legacy nested project key: `~<spaceKey>~<projectKey>~`.
pub fn legacy_project(space: &str, project: &str) -> StoreResult<String> {
    validate_component(space)?;
    validate_component(project)?;
    Ok(format!("~{space}~{project}~"))
}

/// Prefix of every legacy project under a space.
pub fn legacy_space_prefix(space: &str) -> StoreResult<String> {
    validate_component(space)?;
    Ok(format!("~{space}~"))
}

/// App project key: `~app~<appId>~user~<userKey>~project~<projectKey>`.
pub fn app_project(app: &str, user: &str, project: &str) -> StoreResult<String> {
    validate_component(app)?;
    validate_component(user)?;
    validate_component(project)?;
    Ok(format!("~app~{app}~user~{user}~project~{project}"))
}

/// Prefix of every app project in an `(appId, userKey)` scope.
pub fn app_projects_prefix(app: &str, user: &str) -> StoreResult<String> {
    validate_component(app)?;
    validate_component(user)?;
    Ok(format!("~app~{app}~user~{user}~project~"))
}

/// App request key: `~app~<appId>~user~<userKey>~request~<requestKey>`.
pub fn app_request(app: &str, user: &str, request: &str) -> StoreResult<String> {
    validate_component(app)?;
    validate_component(user)?;
    validate_component(request)?;
    Ok(format!("~app~{app}~user~{user}~request~{request}"))
}

/// Prefix of every app request in an `(appId, userKey)` scope.
pub fn app_requests_prefix(app: &str, user: &str) -> StoreResult<String> {
    validate_component(app)?;
    validate_component(user)?;
    Ok(format!("~app~{app}~user~{user}~request~"))
}

/// History data key: `~history~<isoTime>~<userKey>~`.
pub fn history_data(time: &str, user: &str) -> StoreResult<String> {
    validate_component(time)?;
    validate_component(user)?;
    Ok(format!("~history~{time}~{user}~"))
}

/// History index key: `~history~<tag>~<isoTime>~<scopeKey>~<userKey>~`.
///
/// `tag` is one of `space`, `project`, `request`, `app`, selecting the
/// pointer sub-store the key lives in.
pub fn history_index(tag: &str, time: &str, scope: &str, user: &str) -> StoreResult<String> {
    validate_component(tag)?;
    validate_component(time)?;
    validate_component(scope)?;
    validate_component(user)?;
    Ok(format!("~history~{tag}~{time}~{scope}~{user}~"))
}

/// Prefix of every history index entry for one scope key.
pub fn history_index_prefix(tag: &str) -> String {
    format!("~history~{tag}~")
}

/// Revision key: `~<kind>~<parentKey>~<creationMillis>~`.
///
/// Millis are zero-padded so the keys under one prefix sort oldest-first;
/// reverse iteration yields newest-first.
pub fn revision(kind: &str, parent: &str, millis: i64) -> StoreResult<String> {
    validate_component(kind)?;
    validate_component(parent)?;
    Ok(format!("~{kind}~{parent}~{millis:0width$}~", width = MILLIS_WIDTH))
}

/// Prefix of every revision of one (kind, parent) pair.
pub fn revision_prefix(kind: &str, parent: &str) -> StoreResult<String> {
    validate_component(kind)?;
    validate_component(parent)?;
    Ok(format!("~{kind}~{parent}~"))
}

/// Shared-link key: `~shared~<userKey>~<fileKey>`.
pub fn shared(user: &str, file: &str) -> StoreResult<String> {
    validate_component(user)?;
    validate_component(file)?;
    Ok(format!("~shared~{user}~{file}"))
}

/// Prefix of every shared link of one user.
pub fn shared_prefix(user: &str) -> StoreResult<String> {
    validate_component(user)?;
    Ok(format!("~shared~{user}~"))
}

/// Bin key: `~deleted~<kind>~<originalKey>`.
pub fn bin(kind: &str, key: &str) -> StoreResult<String> {
    validate_component(kind)?;
    validate_component(key)?;
    Ok(format!("~deleted~{kind}~{key}"))
}

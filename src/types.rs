//! Entity records stored by the engine.
//!
//! All records serialize to camelCase JSON, which is the wire format and
//! the stored format (sub-store values are UTF-8 JSON). Server-managed
//! fields (`permissions`, `permissionIds`, `parents`, `owner`) are plain
//! data here; the stores enforce who may write them.

use chrono::Utc;
use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Schema tag for workspaces (folder-like files, may nest).
pub const KIND_WORKSPACE: &str = "Workspace";
/// Schema tag for HTTP project files.
pub const KIND_HTTP_PROJECT: &str = "HttpProject";
/// Schema tag for data files.
pub const KIND_DATA_FILE: &str = "DataFile";
/// Schema tag for stored revisions.
pub const KIND_REVISION: &str = "Revision";
/// Schema tag for app-scoped projects.
pub const KIND_APP_PROJECT: &str = "AppProject";
/// Schema tag for app-scoped requests.
pub const KIND_APP_REQUEST: &str = "AppRequest";
/// Schema tag for legacy spaces.
pub const KIND_SPACE: &str = "Space";

/// Sentinel identity used in single-user mode.
pub const DEFAULT_USER_KEY: &str = "default";

/// Current epoch time in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Roles, totally ordered `reader < commenter < writer < owner`.
///
/// `owner` is implicit for resource creators and never stored as a
/// permission record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Commenter,
    Writer,
    Owner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Reader => "reader",
            Role::Commenter => "commenter",
            Role::Writer => "writer",
            Role::Owner => "owner",
        };
        f.write_str(s)
    }
}

/// Subject type of a permission record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionType {
    User,
    Group,
    Anyone,
}

/// A stored permission record.
///
/// For `anyone` the `owner` field is absent; for `user`/`group` it holds
/// the subject id. At most one record exists per (resource, subject).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub key: String,
    /// The user that added this record.
    pub adding_user: String,
    /// Subject id for `user`/`group` records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(rename = "type")]
    pub kind: PermissionType,
    pub role: Role,
    /// Epoch millis after which the record is ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<i64>,
}

impl Permission {
    /// Whether the record has expired relative to `now` (epoch millis).
    pub fn expired_at(&self, now: i64) -> bool {
        matches!(self.expiration_time, Some(t) if t <= now)
    }

    /// Whether this record names the given subject.
    pub fn matches_subject(&self, kind: PermissionType, id: Option<&str>) -> bool {
        self.kind == kind && self.owner.as_deref() == id
    }
}

/// Descriptive fields of a file or space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Who touched a record last, and when (epoch millis).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedBy {
    pub user: String,
    pub time: i64,
}

/// Metadata of a workspace or project/data file.
///
/// `parents` is the ordered chain root → direct parent. `permissions` is a
/// read-side denormalization of the records in the permission store and is
/// never authoritative; it is rehydrated on every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub key: String,
    pub kind: String,
    pub info: FileInfo,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub permission_ids: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub last_modified: ModifiedBy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl FileMeta {
    /// A fresh meta record with the given key, kind, and name.
    pub fn new(key: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            info: FileInfo {
                name: name.into(),
                display_name: None,
                description: None,
            },
            owner: String::new(),
            parents: Vec::new(),
            permission_ids: Vec::new(),
            permissions: Vec::new(),
            last_modified: ModifiedBy::default(),
            deleted: None,
        }
    }

    /// Whether the record carries the soft-delete marker.
    pub fn is_deleted(&self) -> bool {
        self.deleted == Some(true)
    }
}

/// Contents of a file, distinct from its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub value: JsonValue,
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl Media {
    pub fn is_deleted(&self) -> bool {
        self.deleted == Some(true)
    }
}

/// Which representation of a file an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alt {
    /// The metadata record.
    Meta,
    /// The stored contents.
    Media,
}

/// A stored patch with its inverse, timestamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// The revision key; contains the owning key and the creation millis.
    pub id: String,
    /// The key of the patched record.
    pub key: String,
    pub kind: String,
    /// Creation time, epoch millis.
    pub created: i64,
    pub deleted: bool,
    pub patch: Patch,
    /// Inverse patch; applying it to the post-patch document restores the
    /// pre-patch document.
    pub revert: Patch,
}

/// Record of a soft deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinItem {
    pub key: String,
    pub deleted_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

/// Reverse-index entry: a file shared with a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedLink {
    /// The file key.
    pub id: String,
    /// The grantee.
    pub uid: String,
    /// Immediate parent id when the share was granted at a child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// An email attached to a user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEmail {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

/// A user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub email: Vec<UserEmail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl User {
    /// A bare user with a key and a name.
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            email: Vec::new(),
            groups: Vec::new(),
            picture: None,
            locale: None,
        }
    }

    /// The sentinel identity used in single-user mode.
    pub fn default_local() -> Self {
        Self::new(DEFAULT_USER_KEY, "Default user")
    }
}

/// Scope meta attached to app-scoped records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDocMeta {
    pub app_id: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

/// An app-scoped record: project or request.
///
/// The scope `(appId, userKey)` partitions the data; records are invisible
/// across that scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDoc {
    pub meta: AppDocMeta,
    pub data: JsonValue,
}

impl AppDoc {
    pub fn is_deleted(&self) -> bool {
        self.meta.deleted == Some(true)
    }

    /// The record key carried inside `data`.
    pub fn data_key(&self) -> Option<&str> {
        self.data.get("key").and_then(JsonValue::as_str)
    }
}

/// The request/response pair stored for a history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryLog {
    pub request: JsonValue,
    pub response: JsonValue,
}

/// A stored HTTP request/response trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub key: String,
    /// Creation time, epoch millis.
    pub created: i64,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    pub log: HistoryLog,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Reader < Role::Commenter);
        assert!(Role::Commenter < Role::Writer);
        assert!(Role::Writer < Role::Owner);
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_value(Role::Reader).unwrap(), json!("reader"));
        assert_eq!(serde_json::to_value(Role::Owner).unwrap(), json!("owner"));
    }

    #[test]
    fn test_permission_expiry() {
        let perm = Permission {
            key: "p1".to_string(),
            adding_user: "u1".to_string(),
            owner: Some("u2".to_string()),
            kind: PermissionType::User,
            role: Role::Reader,
            expiration_time: Some(1000),
        };
        assert!(perm.expired_at(1000));
        assert!(perm.expired_at(2000));
        assert!(!perm.expired_at(999));
    }

    #[test]
    fn test_file_meta_wire_shape() {
        let meta = FileMeta::new("s1", KIND_WORKSPACE, "My space");
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["key"], "s1");
        assert_eq!(value["kind"], "Workspace");
        assert_eq!(value["info"]["name"], "My space");
        assert!(value["permissionIds"].as_array().unwrap().is_empty());
        // Soft-delete marker stays off the wire until set.
        assert!(value.get("deleted").is_none());
    }

    #[test]
    fn test_anyone_permission_omits_owner() {
        let perm = Permission {
            key: "p1".to_string(),
            adding_user: "u1".to_string(),
            owner: None,
            kind: PermissionType::Anyone,
            role: Role::Reader,
            expiration_time: None,
        };
        let value = serde_json::to_value(&perm).unwrap();
        assert_eq!(value["type"], "anyone");
        assert!(value.get("owner").is_none());
    }
}

//! CRUD over permission records.
//!
//! Records are stored flat under their own keys; resources reference them
//! through `permissionIds`. The authoritative copy always lives here — the
//! `permissions` array on a file is a read-side denormalization rehydrated
//! on every read.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::kv::SubStore;
use crate::types::{Permission, PermissionType, Role};

/// Store of permission records.
pub struct PermissionStore {
    sub: Arc<SubStore>,
}

impl PermissionStore {
    pub fn new(sub: Arc<SubStore>) -> Self {
        Self { sub }
    }

    /// Build a fresh record with a generated key.
    pub fn create_record(
        adding_user: &str,
        kind: PermissionType,
        owner: Option<String>,
        role: Role,
        expiration_time: Option<i64>,
    ) -> Permission {
        Permission {
            key: Uuid::new_v4().to_string(),
            adding_user: adding_user.to_string(),
            owner,
            kind,
            role,
            expiration_time,
        }
    }

    /// Insert or replace a record under its key.
    pub async fn put(&self, permission: &Permission) -> StoreResult<()> {
        self.sub.put_json(&permission.key, permission).await
    }

    /// Read one record.
    pub async fn read(&self, id: &str) -> StoreResult<Permission> {
        self.sub.get_json(id).await
    }

    /// Read many records, preserving input order; missing slots are `None`.
    pub async fn read_many(&self, ids: &[String]) -> StoreResult<Vec<Option<Permission>>> {
        self.sub.get_many_json(ids).await
    }

    /// Delete one record. Idempotent.
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        self.sub.del(id).await
    }
}

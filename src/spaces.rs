//! Legacy space store.
//!
//! The earlier incarnation of the file tree: identical semantics, its own
//! `spaces` partition and `/spaces` URL family, and nested project keys in
//! the legacy `~<space>~<project>~` shape (see [`crate::projects`]). A key
//! never crosses between this family and the newer file family.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::access::AccessResolver;
use crate::cursor::ListState;
use crate::error::StoreResult;
use crate::files::{AccessOperation, FileStore};
use crate::types::{FileMeta, User};

/// Meta store for the legacy space route family.
pub struct SpaceStore {
    core: FileStore,
}

impl SpaceStore {
    pub fn new(core: FileStore) -> Self {
        Self { core }
    }

    pub fn resolver(&self) -> &Arc<AccessResolver> {
        self.core.resolver()
    }

    pub async fn add(
        &self,
        space: FileMeta,
        user: Option<&User>,
        parent: Option<&str>,
    ) -> StoreResult<FileMeta> {
        self.core.add(space, user, parent).await
    }

    pub async fn read(&self, key: &str, user: Option<&User>) -> StoreResult<FileMeta> {
        self.core.read(key, user).await
    }

    pub async fn list(
        &self,
        user: Option<&User>,
        kinds: Option<&[String]>,
        state: &ListState,
    ) -> StoreResult<(Vec<FileMeta>, Option<String>)> {
        self.core.list(user, kinds, state).await
    }

    pub async fn apply_patch(
        &self,
        key: &str,
        info: &JsonValue,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        self.core.apply_patch(key, info, user).await
    }

    pub async fn delete(&self, key: &str, user: Option<&User>) -> StoreResult<FileMeta> {
        self.core.delete(key, user).await
    }

    pub async fn patch_access(
        &self,
        key: &str,
        ops: &[AccessOperation],
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        self.core.patch_access(key, ops, user).await
    }
}

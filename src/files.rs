//! The file metadata tree.
//!
//! Stores workspaces and project/data files with their parent chains,
//! owner, and permission references. All mutations here are single-entity;
//! cascades (descendant deletion, media) are composed by the hub.
//!
//! The same core serves the legacy space family: a second instance runs on
//! the `spaces` partition with the `/spaces` route base. The two families
//! never share a key.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::access::AccessResolver;
use crate::bus::{ChannelFilter, Event, NotificationBus, Operation};
use crate::cursor::ListState;
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::kv::{IterateOptions, SubStore};
use crate::patch::{self, FILE_META_GUARDS};
use crate::permissions::PermissionStore;
use crate::shared::SharedIndex;
use crate::trash::Bin;
use crate::types::{now_millis, FileMeta, ModifiedBy, PermissionType, Role, User};
use crate::users::UserStore;

/// URL family a meta store emits events on.
#[derive(Debug, Clone, Copy)]
pub struct RouteSet {
    base: &'static str,
}

impl RouteSet {
    pub const FILES: RouteSet = RouteSet { base: "/files" };
    pub const SPACES: RouteSet = RouteSet { base: "/spaces" };

    pub fn collection(&self) -> String {
        self.base.to_string()
    }

    pub fn item(&self, key: &str) -> String {
        format!("{}/{key}", self.base)
    }

    /// The child collection of a folder-like entry.
    pub fn children(&self, key: &str) -> String {
        format!("{}/{key}/files", self.base)
    }
}

/// One operation inside an access patch.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessOperation {
    pub op: AccessOp,
    #[serde(rename = "type")]
    pub kind: PermissionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The role to grant; required for `add`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessOp {
    Add,
    Remove,
}

/// Meta-tree store for one family (files or legacy spaces).
pub struct FileStore {
    sub: Arc<SubStore>,
    permissions: Arc<PermissionStore>,
    shared: Arc<SharedIndex>,
    users: Arc<UserStore>,
    bin: Arc<Bin>,
    resolver: Arc<AccessResolver>,
    bus: Arc<NotificationBus>,
    routes: RouteSet,
}

impl FileStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sub: Arc<SubStore>,
        permissions: Arc<PermissionStore>,
        shared: Arc<SharedIndex>,
        users: Arc<UserStore>,
        bin: Arc<Bin>,
        resolver: Arc<AccessResolver>,
        bus: Arc<NotificationBus>,
        routes: RouteSet,
    ) -> Self {
        Self {
            sub,
            permissions,
            shared,
            users,
            bin,
            resolver,
            bus,
            routes,
        }
    }

    /// The access resolver of this family.
    pub fn resolver(&self) -> &Arc<AccessResolver> {
        &self.resolver
    }

    /// The URL family of this store.
    pub fn routes(&self) -> RouteSet {
        self.routes
    }

    fn effective_user(&self, user: Option<&User>) -> StoreResult<User> {
        match user {
            Some(user) => Ok(user.clone()),
            None if self.resolver.single_user() => Ok(User::default_local()),
            None => Err(StoreError::Unauthenticated),
        }
    }

    /// Create a file.
    ///
    /// With a parent the caller needs `writer` there and the chain is
    /// extended; without one the file becomes a root owned by the caller.
    /// Server-managed fields are reset regardless of what the client sent.
    pub async fn add(
        &self,
        mut file: FileMeta,
        user: Option<&User>,
        parent: Option<&str>,
    ) -> StoreResult<FileMeta> {
        keys::validate_component(&file.key)?;
        let actor = self.effective_user(user)?;

        file.parents = match parent {
            Some(parent_key) => {
                self.resolver
                    .check_access(Role::Writer, parent_key, user)
                    .await?;
                let parent_meta = self.resolver.read_meta(parent_key, false).await?;
                let mut chain = parent_meta.parents.clone();
                chain.push(parent_meta.key);
                chain
            }
            None => Vec::new(),
        };

        if self.sub.has(&file.key).await {
            return Err(StoreError::AlreadyExists {
                key: file.key.clone(),
            });
        }

        file.owner = actor.key.clone();
        file.permissions = Vec::new();
        file.permission_ids = Vec::new();
        file.deleted = None;
        file.last_modified = ModifiedBy {
            user: actor.key.clone(),
            time: now_millis(),
        };
        self.sub.put_json(&file.key, &file).await?;

        let audience = self.audience(&file).await;
        let event = Event::new(Operation::Created, &file.kind)
            .with_id(&file.key)
            .with_data(serde_json::to_value(&file)?);
        self.bus
            .notify(
                &event,
                &ChannelFilter::url(self.routes.collection()).for_users(audience),
            )
            .await;
        Ok(file)
    }

    /// Read a file's metadata, rehydrating its permission array.
    pub async fn read(&self, key: &str, user: Option<&User>) -> StoreResult<FileMeta> {
        self.resolver.check_access(Role::Reader, key, user).await?;
        let mut meta = self.resolver.read_meta(key, false).await?;
        self.resolver.hydrate(&mut meta).await?;
        Ok(meta)
    }

    /// List files visible to the caller.
    ///
    /// Without a parent: files the caller owns plus files shared with them
    /// directly. With a parent: `reader` on the parent, then every live
    /// file whose chain ends in it — inherited access included.
    pub async fn list(
        &self,
        user: Option<&User>,
        kinds: Option<&[String]>,
        state: &ListState,
    ) -> StoreResult<(Vec<FileMeta>, Option<String>)> {
        let actor = self.effective_user(user)?;
        if let Some(parent) = &state.parent {
            self.resolver
                .check_access(Role::Reader, parent, user)
                .await?;
        }

        let mut iter = self.sub.iterate(IterateOptions {
            gte: state.last_key.clone(),
            ..Default::default()
        });
        let mut items = Vec::new();
        let mut last_key = None;
        while let Some(entry) = iter.next().await {
            if state.last_key.as_deref() == Some(entry.key.as_str()) {
                continue;
            }
            if items.len() >= state.limit {
                break;
            }
            let Some(bytes) = entry.value else { continue };
            let mut meta: FileMeta = serde_json::from_slice(&bytes)?;
            if meta.is_deleted() {
                continue;
            }
            let visible = match &state.parent {
                Some(parent) => meta.parents.last() == Some(parent),
                None => {
                    meta.owner == actor.key || self.shared.has(&actor.key, &meta.key).await
                }
            };
            if !visible {
                continue;
            }
            if let Some(kinds) = kinds {
                if !kinds.is_empty() && !kinds.iter().any(|k| k == &meta.kind) {
                    continue;
                }
            }
            if let Some(since) = state.since {
                if meta.last_modified.time < since {
                    continue;
                }
            }
            self.resolver.hydrate(&mut meta).await?;
            last_key = Some(entry.key);
            items.push(meta);
        }
        Ok((items, last_key))
    }

    /// Apply a metadata patch.
    ///
    /// Requires `writer`; refuses patches touching `/key`, `/kind`,
    /// `/owner`, `/permissions`, `/permissionIds`, or `/parents`.
    pub async fn apply_patch(
        &self,
        key: &str,
        info: &JsonValue,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        self.resolver.check_access(Role::Writer, key, user).await?;
        let parsed = patch::validate_with_guards(info, FILE_META_GUARDS)?;
        let actor = self.effective_user(user)?;

        let meta = self.resolver.read_meta(key, false).await?;
        let doc = serde_json::to_value(&meta)?;
        let (patched, _revert) = patch::apply(&doc, &parsed.patch)?;
        let mut updated: FileMeta = serde_json::from_value(patched)
            .map_err(|e| StoreError::invalid_patch(format!("patch breaks the schema: {e}")))?;
        updated.last_modified = ModifiedBy {
            user: actor.key.clone(),
            time: now_millis(),
        };
        self.sub.put_json(key, &updated).await?;

        let event = Event::new(Operation::Patch, &updated.kind)
            .with_id(key)
            .with_data(serde_json::to_value(&parsed.patch)?);
        self.bus
            .notify(&event, &ChannelFilter::url(self.routes.item(key)))
            .await;
        let audience = self.audience(&updated).await;
        self.bus
            .notify(
                &event,
                &ChannelFilter::url(self.routes.collection()).for_users(audience),
            )
            .await;
        Ok(updated)
    }

    /// Soft-delete one file: marker, bin entry, shared-link removal,
    /// `deleted` events, forced channel closes.
    ///
    /// Descendants and media are cascaded by the hub.
    pub async fn delete(&self, key: &str, user: Option<&User>) -> StoreResult<FileMeta> {
        self.resolver.check_access(Role::Writer, key, user).await?;
        let meta = self.resolver.read_meta(key, false).await?;
        self.delete_resolved(meta, user).await
    }

    /// Delete a file whose access was already established (cascades).
    pub(crate) async fn delete_resolved(
        &self,
        mut meta: FileMeta,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        let actor = self.effective_user(user)?;
        meta.deleted = Some(true);
        meta.last_modified = ModifiedBy {
            user: actor.key.clone(),
            time: now_millis(),
        };
        self.sub.put_json(&meta.key, &meta).await?;
        self.bin.add(&meta.kind, &meta.key, user).await?;
        self.shared.remove_all_for_file(&meta.key).await?;

        let event = Event::new(Operation::Deleted, &meta.kind).with_id(&meta.key);
        let audience = self.audience(&meta).await;
        self.bus
            .notify(
                &event,
                &ChannelFilter::url(self.routes.collection()).for_users(audience),
            )
            .await;
        let item_url = self.routes.item(&meta.key);
        self.bus
            .notify(&event, &ChannelFilter::url(item_url.clone()))
            .await;

        self.bus.close_by_url(&item_url).await;
        self.bus.close_by_url(&self.routes.children(&meta.key)).await;
        Ok(meta)
    }

    /// Live files whose parent chain contains `key`.
    pub async fn descendants(&self, key: &str) -> StoreResult<Vec<FileMeta>> {
        let mut iter = self.sub.iterate(IterateOptions::default());
        let mut found = Vec::new();
        while let Some(entry) = iter.next().await {
            let Some(bytes) = entry.value else { continue };
            let meta: FileMeta = serde_json::from_slice(&bytes)?;
            if !meta.is_deleted() && meta.parents.iter().any(|p| p == key) {
                found.push(meta);
            }
        }
        Ok(found)
    }

    /// Apply access operations to a file.
    ///
    /// Requires `writer`. Adds are idempotent per (resource, subject):
    /// re-adding updates the role and expiration. Removes of absent
    /// subjects are no-ops. Shared links follow user-type grants.
    pub async fn patch_access(
        &self,
        key: &str,
        ops: &[AccessOperation],
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        self.resolver.check_access(Role::Writer, key, user).await?;
        let actor = self.effective_user(user)?;
        let mut meta = self.resolver.read_meta(key, false).await?;
        let before = serde_json::to_value(&meta)?;

        self.validate_access_ops(ops).await?;

        let mut granted: Vec<(String, Role)> = Vec::new();
        let mut removed: Vec<String> = Vec::new();

        for op in ops {
            match op.op {
                AccessOp::Add => {
                    let role = op.value.expect("validated");
                    let existing = self.find_permission(&meta, op).await?;
                    match existing {
                        Some(mut record) => {
                            record.role = role;
                            record.expiration_time = op.expiration_time;
                            self.permissions.put(&record).await?;
                        }
                        None => {
                            let record = PermissionStore::create_record(
                                &actor.key,
                                op.kind,
                                op.id.clone(),
                                role,
                                op.expiration_time,
                            );
                            self.permissions.put(&record).await?;
                            meta.permission_ids.push(record.key.clone());
                        }
                    }
                    if op.kind == PermissionType::User {
                        let uid = op.id.clone().expect("validated");
                        self.shared
                            .add(&uid, key, meta.parents.last().cloned())
                            .await?;
                        granted.push((uid, role));
                    }
                }
                AccessOp::Remove => {
                    if let Some(record) = self.find_permission(&meta, op).await? {
                        self.permissions.delete(&record.key).await?;
                        meta.permission_ids.retain(|id| id != &record.key);
                        if op.kind == PermissionType::User {
                            let uid = op.id.clone().expect("validated");
                            self.shared.remove(&uid, key).await?;
                            removed.push(uid);
                        }
                    }
                }
            }
        }

        meta.last_modified = ModifiedBy {
            user: actor.key.clone(),
            time: now_millis(),
        };
        self.sub.put_json(key, &meta).await?;

        for (uid, role) in granted {
            let event = Event::new(Operation::AccessGranted, &meta.kind)
                .with_id(key)
                .with_data(serde_json::json!({ "role": role }));
            self.bus
                .notify(&event, &ChannelFilter::users(vec![uid]))
                .await;
        }
        for uid in removed {
            let event = Event::new(Operation::AccessRemoved, &meta.kind).with_id(key);
            self.bus
                .notify(&event, &ChannelFilter::users(vec![uid]))
                .await;
        }

        let after = serde_json::to_value(&meta)?;
        let delta = patch::diff(&before, &after);
        let event = Event::new(Operation::Patch, &meta.kind)
            .with_id(key)
            .with_data(serde_json::to_value(&delta)?);
        self.bus
            .notify(&event, &ChannelFilter::url(self.routes.item(key)))
            .await;

        self.resolver.hydrate(&mut meta).await?;
        Ok(meta)
    }

    async fn validate_access_ops(&self, ops: &[AccessOperation]) -> StoreResult<()> {
        let now = now_millis();
        let mut subject_ids = Vec::new();
        for op in ops {
            match op.kind {
                PermissionType::User | PermissionType::Group => {
                    if op.id.is_none() {
                        return Err(StoreError::invalid(
                            "\"id\" is required for user and group operations",
                        ));
                    }
                }
                PermissionType::Anyone => {}
            }
            if op.op == AccessOp::Add {
                if op.value.is_none() {
                    return Err(StoreError::invalid("\"value\" is required for add"));
                }
                if let Some(expiration) = op.expiration_time {
                    if expiration <= now {
                        return Err(StoreError::invalid("expiration time is in the past"));
                    }
                }
                if op.kind == PermissionType::User {
                    subject_ids.push(op.id.clone().expect("checked above"));
                }
            }
        }
        if !subject_ids.is_empty() {
            let missing = self.users.list_missing(&subject_ids).await?;
            if !missing.is_empty() {
                return Err(StoreError::invalid(format!(
                    "unknown users: {}",
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// The stored record matching an operation's (type, subject) pair.
    async fn find_permission(
        &self,
        meta: &FileMeta,
        op: &AccessOperation,
    ) -> StoreResult<Option<crate::types::Permission>> {
        let records = self.permissions.read_many(&meta.permission_ids).await?;
        Ok(records
            .into_iter()
            .flatten()
            .find(|record| record.matches_subject(op.kind, op.id.as_deref())))
    }

    /// Users who should see collection events for this file: the owner
    /// plus every user-type subject along the chain.
    async fn audience(&self, meta: &FileMeta) -> Vec<String> {
        let mut users = vec![meta.owner.clone()];
        let mut chain = vec![meta.clone()];
        for ancestor in meta.parents.iter().rev() {
            if let Ok(ancestor_meta) = self.resolver.read_meta(ancestor, true).await {
                chain.push(ancestor_meta);
            }
        }
        for link in &chain {
            if !users.contains(&link.owner) {
                users.push(link.owner.clone());
            }
            if let Ok(records) = self.permissions.read_many(&link.permission_ids).await {
                for record in records.into_iter().flatten() {
                    if record.kind == PermissionType::User {
                        if let Some(owner) = &record.owner {
                            if !users.contains(owner) {
                                users.push(owner.clone());
                            }
                        }
                    }
                }
            }
        }
        users
    }
}

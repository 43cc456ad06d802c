//! Legacy project contents.
//!
//! Projects nested under legacy spaces keep their metadata in the
//! `projects/index` partition under `~<space>~<project>~` keys, contents
//! in `projects/data`, and patch history in `projects/revisions`. Access
//! is resolved against the enclosing space. Renaming a project through a
//! content patch propagates the new name into the index record.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::access::AccessResolver;
use crate::bus::{urls, ChannelFilter, Event, NotificationBus, Operation};
use crate::cursor::ListState;
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::kv::{IterateOptions, SubStore};
use crate::patch;
use crate::revisions::RevisionStore;
use crate::trash::Bin;
use crate::types::{
    now_millis, FileMeta, Media, ModifiedBy, Revision, Role, User, KIND_HTTP_PROJECT,
};

pub struct ProjectStore {
    index: Arc<SubStore>,
    data: Arc<SubStore>,
    revisions: Arc<RevisionStore>,
    bin: Arc<Bin>,
    resolver: Arc<AccessResolver>,
    bus: Arc<NotificationBus>,
}

impl ProjectStore {
    pub fn new(
        index: Arc<SubStore>,
        data: Arc<SubStore>,
        revisions: Arc<RevisionStore>,
        bin: Arc<Bin>,
        resolver: Arc<AccessResolver>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            index,
            data,
            revisions,
            bin,
            resolver,
            bus,
        }
    }

    /// Create a project under a space, with its initial contents.
    pub async fn add(
        &self,
        space: &str,
        key: &str,
        name: &str,
        contents: JsonValue,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        self.resolver
            .check_access(Role::Writer, space, user)
            .await?;
        let legacy_key = keys::legacy_project(space, key)?;
        if self.index.has(&legacy_key).await {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }

        let actor_key = user
            .map(|u| u.key.clone())
            .unwrap_or_else(|| crate::types::DEFAULT_USER_KEY.to_string());
        let mut meta = FileMeta::new(key, KIND_HTTP_PROJECT, name);
        meta.owner = actor_key.clone();
        meta.parents = vec![space.to_string()];
        meta.last_modified = ModifiedBy {
            user: actor_key,
            time: now_millis(),
        };
        self.index.put_json(&legacy_key, &meta).await?;

        let media = Media {
            value: contents,
            mime: "application/json".to_string(),
            deleted: None,
        };
        self.data.put_json(&legacy_key, &media).await?;

        let event = Event::new(Operation::Created, KIND_HTTP_PROJECT)
            .with_id(key)
            .with_data(serde_json::to_value(&meta)?);
        self.bus
            .notify(&event, &ChannelFilter::url(urls::space_projects(space)))
            .await;
        Ok(meta)
    }

    /// Read project metadata.
    pub async fn read_meta(
        &self,
        space: &str,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        self.resolver
            .check_access(Role::Reader, space, user)
            .await?;
        let legacy_key = keys::legacy_project(space, key)?;
        let meta: FileMeta = self
            .index
            .get_json(&legacy_key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if meta.is_deleted() {
            return Err(StoreError::not_found(key));
        }
        Ok(meta)
    }

    /// Read project contents.
    pub async fn read_media(
        &self,
        space: &str,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<Media> {
        self.resolver
            .check_access(Role::Reader, space, user)
            .await?;
        let legacy_key = keys::legacy_project(space, key)?;
        let media: Media = self
            .data
            .get_json(&legacy_key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if media.is_deleted() {
            return Err(StoreError::not_found(key));
        }
        Ok(media)
    }

    /// List live projects of a space.
    pub async fn list(
        &self,
        space: &str,
        user: Option<&User>,
        state: &ListState,
    ) -> StoreResult<(Vec<FileMeta>, Option<String>)> {
        self.resolver
            .check_access(Role::Reader, space, user)
            .await?;
        let prefix = keys::legacy_space_prefix(space)?;
        let (mut gte, lte) = keys::prefix_range(&prefix);
        if let Some(last) = &state.last_key {
            if last.as_str() > gte.as_str() {
                gte = last.clone();
            }
        }
        let mut iter = self.index.iterate(IterateOptions {
            gte: Some(gte),
            lte: Some(lte),
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
            let meta: FileMeta = serde_json::from_slice(&bytes)?;
            if meta.is_deleted() {
                continue;
            }
            last_key = Some(entry.key);
            items.push(meta);
        }
        Ok((items, last_key))
    }

    /// Patch project contents.
    ///
    /// Appends a revision and, when the patch renames the project,
    /// propagates the new name into the index record.
    pub async fn apply_patch(
        &self,
        space: &str,
        key: &str,
        info: &JsonValue,
        user: Option<&User>,
    ) -> StoreResult<Revision> {
        self.resolver
            .check_access(Role::Writer, space, user)
            .await?;
        let parsed = patch::validate(info)?;
        let legacy_key = keys::legacy_project(space, key)?;

        let mut media: Media = self
            .data
            .get_json(&legacy_key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if media.is_deleted() {
            return Err(StoreError::not_found(key));
        }
        let (patched, revert) = patch::apply(&media.value, &parsed.patch)?;
        let new_name = patched
            .get("info")
            .and_then(|info| info.get("name"))
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        media.value = patched;
        self.data.put_json(&legacy_key, &media).await?;

        if let Some(name) = new_name {
            let mut meta: FileMeta = self.index.get_json(&legacy_key).await?;
            if meta.info.name != name {
                meta.info.name = name;
                meta.last_modified = ModifiedBy {
                    user: user
                        .map(|u| u.key.clone())
                        .unwrap_or_else(|| crate::types::DEFAULT_USER_KEY.to_string()),
                    time: now_millis(),
                };
                self.index.put_json(&legacy_key, &meta).await?;
            }
        }

        let revision = self
            .revisions
            .add(KIND_HTTP_PROJECT, key, &parsed.patch, &revert)
            .await?;

        let item_url = urls::space_project(space, key);
        let created = Event::new(Operation::Created, crate::types::KIND_REVISION)
            .with_id(revision.id.clone());
        self.bus
            .notify(&created, &ChannelFilter::url(item_url.clone()))
            .await;
        let patched_event = Event::new(Operation::Patch, KIND_HTTP_PROJECT)
            .with_id(key)
            .with_data(serde_json::to_value(&parsed.patch)?);
        self.bus
            .notify(&patched_event, &ChannelFilter::url(item_url))
            .await;
        Ok(revision)
    }

    /// Soft-delete every live project of a space.
    ///
    /// Runs inside the space-deletion cascade; access was already
    /// established on the space.
    pub(crate) async fn delete_for_space(
        &self,
        space: &str,
        user: Option<&User>,
    ) -> StoreResult<()> {
        let prefix = keys::legacy_space_prefix(space)?;
        let mut iter = self.index.iterate(IterateOptions::prefix(&prefix));
        let mut doomed = Vec::new();
        while let Some(entry) = iter.next().await {
            let Some(bytes) = entry.value else { continue };
            let meta: FileMeta = serde_json::from_slice(&bytes)?;
            if !meta.is_deleted() {
                doomed.push((entry.key, meta));
            }
        }
        for (legacy_key, mut meta) in doomed {
            meta.deleted = Some(true);
            self.index.put_json(&legacy_key, &meta).await?;
            if let Ok(mut media) = self.data.get_json::<Media>(&legacy_key).await {
                media.deleted = Some(true);
                self.data.put_json(&legacy_key, &media).await?;
            }
            self.bin.add(KIND_HTTP_PROJECT, &meta.key, user).await?;

            let event = Event::new(Operation::Deleted, KIND_HTTP_PROJECT).with_id(&meta.key);
            let item_url = urls::space_project(space, &meta.key);
            self.bus
                .notify(&event, &ChannelFilter::url(item_url.clone()))
                .await;
            self.bus.close_by_url(&item_url).await;
        }
        Ok(())
    }

    /// Soft-delete a project and its contents.
    pub async fn delete(&self, space: &str, key: &str, user: Option<&User>) -> StoreResult<()> {
        self.resolver
            .check_access(Role::Writer, space, user)
            .await?;
        let legacy_key = keys::legacy_project(space, key)?;
        let mut meta: FileMeta = self
            .index
            .get_json(&legacy_key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if meta.is_deleted() {
            return Err(StoreError::not_found(key));
        }
        meta.deleted = Some(true);
        self.index.put_json(&legacy_key, &meta).await?;
        if let Ok(mut media) = self.data.get_json::<Media>(&legacy_key).await {
            media.deleted = Some(true);
            self.data.put_json(&legacy_key, &media).await?;
        }
        self.bin.add(KIND_HTTP_PROJECT, key, user).await?;

        let event = Event::new(Operation::Deleted, KIND_HTTP_PROJECT).with_id(key);
        self.bus
            .notify(&event, &ChannelFilter::url(urls::space_projects(space)))
            .await;
        let item_url = urls::space_project(space, key);
        self.bus
            .notify(&event, &ChannelFilter::url(item_url.clone()))
            .await;
        self.bus.close_by_url(&item_url).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::cursor::{CursorCodec, ListOptions};
    use crate::kv::OrderedStore;
    use crate::permissions::PermissionStore;
    use crate::types::KIND_WORKSPACE;
    use serde_json::json;

    struct Fixture {
        projects: ProjectStore,
        spaces: Arc<SubStore>,
        codec: CursorCodec,
    }

    async fn fixture() -> Fixture {
        let store = OrderedStore::open(&StoreConfig::in_memory()).await.unwrap();
        let permissions = Arc::new(PermissionStore::new(store.partition("permissions")));
        let bin = Arc::new(Bin::new(store.partition("bin")));
        let spaces = store.partition("spaces");
        let resolver = Arc::new(AccessResolver::new(
            Arc::clone(&spaces),
            permissions,
            Arc::clone(&bin),
            false,
        ));
        let revisions = Arc::new(RevisionStore::new(store.partition("projects/revisions")));
        let projects = ProjectStore::new(
            store.partition("projects/index"),
            store.partition("projects/data"),
            revisions,
            bin,
            resolver,
            Arc::new(NotificationBus::new()),
        );
        Fixture {
            projects,
            spaces,
            codec: CursorCodec::new(Some([1u8; 32])),
        }
    }

    async fn seed_space(fx: &Fixture, key: &str, owner: &str) {
        let mut meta = FileMeta::new(key, KIND_WORKSPACE, key);
        meta.owner = owner.to_string();
        fx.spaces.put_json(key, &meta).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_list_read() {
        let fx = fixture().await;
        seed_space(&fx, "s1", "u1").await;
        let u1 = User::new("u1", "One");

        fx.projects
            .add("s1", "p1", "Project one", json!({"info": {"name": "Project one"}}), Some(&u1))
            .await
            .unwrap();

        let state = fx.codec.read_list_state(&ListOptions::default()).unwrap();
        let (items, _) = fx.projects.list("s1", Some(&u1), &state).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "p1");

        let media = fx.projects.read_media("s1", "p1", Some(&u1)).await.unwrap();
        assert_eq!(media.value["info"]["name"], "Project one");
    }

    #[tokio::test]
    async fn test_outsider_gets_not_found() {
        let fx = fixture().await;
        seed_space(&fx, "s1", "u1").await;
        let u1 = User::new("u1", "One");
        let u2 = User::new("u2", "Two");
        fx.projects
            .add("s1", "p1", "P", json!({}), Some(&u1))
            .await
            .unwrap();
        assert!(matches!(
            fx.projects.read_meta("s1", "p1", Some(&u2)).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_propagates_to_index() {
        let fx = fixture().await;
        seed_space(&fx, "s1", "u1").await;
        let u1 = User::new("u1", "One");
        fx.projects
            .add("s1", "p1", "Old", json!({"info": {"name": "Old"}}), Some(&u1))
            .await
            .unwrap();

        let info = json!({
            "app": "tests", "appVersion": "1.0.0", "id": "pp-1",
            "patch": [{ "op": "replace", "path": "/info/name", "value": "New" }],
        });
        fx.projects
            .apply_patch("s1", "p1", &info, Some(&u1))
            .await
            .unwrap();

        let meta = fx.projects.read_meta("s1", "p1", Some(&u1)).await.unwrap();
        assert_eq!(meta.info.name, "New");
    }

    #[tokio::test]
    async fn test_delete_masks_both_records() {
        let fx = fixture().await;
        seed_space(&fx, "s1", "u1").await;
        let u1 = User::new("u1", "One");
        fx.projects
            .add("s1", "p1", "P", json!({}), Some(&u1))
            .await
            .unwrap();

        fx.projects.delete("s1", "p1", Some(&u1)).await.unwrap();
        assert!(fx.projects.read_meta("s1", "p1", Some(&u1)).await.is_err());
        assert!(fx.projects.read_media("s1", "p1", Some(&u1)).await.is_err());

        let state = fx.codec.read_list_state(&ListOptions::default()).unwrap();
        let (items, _) = fx.projects.list("s1", Some(&u1), &state).await.unwrap();
        assert!(items.is_empty());
    }
}

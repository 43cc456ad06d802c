//! Effective-role resolution over the parent chain.
//!
//! One resolver serves one meta family (the `files` partition or the
//! legacy `spaces` partition); the two families never mix keys. Denials
//! deliberately surface as `NotFound` rather than `Forbidden` when the
//! caller holds no role at all, so probing cannot reveal that a resource
//! exists.

use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::kv::SubStore;
use crate::permissions::PermissionStore;
use crate::trash::Bin;
use crate::types::{now_millis, FileMeta, PermissionType, Role, User};

/// Resolves the effective role of a user on a resource.
pub struct AccessResolver {
    meta: Arc<SubStore>,
    permissions: Arc<PermissionStore>,
    bin: Arc<Bin>,
    single_user: bool,
}

impl AccessResolver {
    pub fn new(
        meta: Arc<SubStore>,
        permissions: Arc<PermissionStore>,
        bin: Arc<Bin>,
        single_user: bool,
    ) -> Self {
        Self {
            meta,
            permissions,
            bin,
            single_user,
        }
    }

    /// Whether the resolver runs in single-user mode.
    pub fn single_user(&self) -> bool {
        self.single_user
    }

    /// Load a meta record, masking soft-deleted and bin-deleted entries as
    /// `NotFound` unless `include_deleted` is set.
    pub async fn read_meta(&self, key: &str, include_deleted: bool) -> StoreResult<FileMeta> {
        let meta: FileMeta = self
            .meta
            .get_json(key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if !include_deleted
            && (meta.is_deleted() || self.bin.is_deleted(&meta.kind, key).await)
        {
            return Err(StoreError::not_found(key));
        }
        Ok(meta)
    }

    /// Rehydrate the read-side `permissions` array from the permission
    /// store. The in-record copy is never trusted for access decisions.
    pub async fn hydrate(&self, meta: &mut FileMeta) -> StoreResult<()> {
        let records = self.permissions.read_many(&meta.permission_ids).await?;
        meta.permissions = records.into_iter().flatten().collect();
        Ok(())
    }

    /// Compute the effective role of `user` on `key`, requiring `min_role`.
    ///
    /// Walks the resource and each ancestor (nearest first), examining
    /// user-specific, group, and `anyone` records, skipping expired ones,
    /// and returns the highest role found anywhere in the chain.
    pub async fn check_access(
        &self,
        min_role: Role,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<Role> {
        if self.single_user {
            return Ok(Role::Owner);
        }
        let user = user.ok_or(StoreError::Unauthenticated)?;

        let meta = self.read_meta(key, false).await?;
        if meta.owner == user.key {
            return Ok(Role::Owner);
        }

        let mut best: Option<Role> = self.role_on(&meta, user).await?;

        // Nearest ancestor first; parents are stored root → direct parent.
        for ancestor in meta.parents.iter().rev() {
            let ancestor_meta = match self.read_meta(ancestor, true).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if ancestor_meta.owner == user.key {
                best = best.max(Some(Role::Owner));
                continue;
            }
            if let Some(role) = self.role_on(&ancestor_meta, user).await? {
                best = best.max(Some(role));
            }
        }

        match best {
            None => Err(StoreError::not_found(key)),
            Some(role) if role < min_role => Err(StoreError::Forbidden {
                key: key.to_string(),
            }),
            Some(role) => Ok(role),
        }
    }

    /// The highest live role the user holds directly on one record.
    async fn role_on(&self, meta: &FileMeta, user: &User) -> StoreResult<Option<Role>> {
        if meta.permission_ids.is_empty() {
            return Ok(None);
        }
        let now = now_millis();
        let records = self.permissions.read_many(&meta.permission_ids).await?;
        let mut best: Option<Role> = None;
        for record in records.into_iter().flatten() {
            if record.expired_at(now) {
                continue;
            }
            let applies = match record.kind {
                PermissionType::User => record.owner.as_deref() == Some(user.key.as_str()),
                PermissionType::Group => record
                    .owner
                    .as_deref()
                    .map(|group| user.groups.iter().any(|g| g == group))
                    .unwrap_or(false),
                PermissionType::Anyone => true,
            };
            if applies {
                best = best.max(Some(record.role));
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::kv::OrderedStore;
    use crate::types::KIND_WORKSPACE;

    struct Fixture {
        resolver: AccessResolver,
        meta: Arc<SubStore>,
        permissions: Arc<PermissionStore>,
        bin: Arc<Bin>,
    }

    async fn fixture(single_user: bool) -> Fixture {
        let store = OrderedStore::open(&StoreConfig::in_memory()).await.unwrap();
        let meta = store.partition("files");
        let permissions = Arc::new(PermissionStore::new(store.partition("permissions")));
        let bin = Arc::new(Bin::new(store.partition("bin")));
        let resolver = AccessResolver::new(
            Arc::clone(&meta),
            Arc::clone(&permissions),
            Arc::clone(&bin),
            single_user,
        );
        Fixture {
            resolver,
            meta,
            permissions,
            bin,
        }
    }

    async fn put_meta(fx: &Fixture, meta: &FileMeta) {
        fx.meta.put_json(&meta.key, meta).await.unwrap();
    }

    async fn grant(fx: &Fixture, meta_key: &str, subject: &str, role: Role) {
        let record = PermissionStore::create_record(
            "u1",
            PermissionType::User,
            Some(subject.to_string()),
            role,
            None,
        );
        fx.permissions.put(&record).await.unwrap();
        let mut meta: FileMeta = fx.meta.get_json(meta_key).await.unwrap();
        meta.permission_ids.push(record.key.clone());
        put_meta(fx, &meta).await;
    }

    fn owned_space(key: &str, owner: &str) -> FileMeta {
        let mut meta = FileMeta::new(key, KIND_WORKSPACE, key);
        meta.owner = owner.to_string();
        meta
    }

    #[tokio::test]
    async fn test_owner_is_implicit() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        let u1 = User::new("u1", "One");
        let role = fx
            .resolver
            .check_access(Role::Owner, "s1", Some(&u1))
            .await
            .unwrap();
        assert_eq!(role, Role::Owner);
    }

    #[tokio::test]
    async fn test_no_user_is_unauthenticated() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        assert!(matches!(
            fx.resolver.check_access(Role::Reader, "s1", None).await,
            Err(StoreError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_no_role_masks_as_not_found() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        let u2 = User::new("u2", "Two");
        assert!(matches!(
            fx.resolver.check_access(Role::Reader, "s1", Some(&u2)).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_insufficient_role_is_forbidden() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        grant(&fx, "s1", "u2", Role::Reader).await;
        let u2 = User::new("u2", "Two");
        assert!(matches!(
            fx.resolver.check_access(Role::Writer, "s1", Some(&u2)).await,
            Err(StoreError::Forbidden { .. })
        ));
        let role = fx
            .resolver
            .check_access(Role::Reader, "s1", Some(&u2))
            .await
            .unwrap();
        assert_eq!(role, Role::Reader);
    }

    #[tokio::test]
    async fn test_role_inherited_from_ancestor() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        grant(&fx, "s1", "u2", Role::Reader).await;

        let mut child = owned_space("p1", "u1");
        child.parents = vec!["s1".to_string()];
        put_meta(&fx, &child).await;

        let u2 = User::new("u2", "Two");
        let role = fx
            .resolver
            .check_access(Role::Reader, "p1", Some(&u2))
            .await
            .unwrap();
        assert_eq!(role, Role::Reader);
    }

    #[tokio::test]
    async fn test_highest_role_in_chain_wins() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        grant(&fx, "s1", "u2", Role::Writer).await;

        let mut child = owned_space("p1", "u1");
        child.parents = vec!["s1".to_string()];
        put_meta(&fx, &child).await;
        grant(&fx, "p1", "u2", Role::Reader).await;

        let u2 = User::new("u2", "Two");
        let role = fx
            .resolver
            .check_access(Role::Reader, "p1", Some(&u2))
            .await
            .unwrap();
        assert_eq!(role, Role::Writer);
    }

    #[tokio::test]
    async fn test_expired_permission_is_ignored() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        let record = PermissionStore::create_record(
            "u1",
            PermissionType::User,
            Some("u2".to_string()),
            Role::Reader,
            Some(now_millis() - 1000),
        );
        fx.permissions.put(&record).await.unwrap();
        let mut meta: FileMeta = fx.meta.get_json("s1").await.unwrap();
        meta.permission_ids.push(record.key.clone());
        put_meta(&fx, &meta).await;

        let u2 = User::new("u2", "Two");
        assert!(fx
            .resolver
            .check_access(Role::Reader, "s1", Some(&u2))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bin_deleted_masks_as_not_found() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        fx.bin.add(KIND_WORKSPACE, "s1", None).await.unwrap();
        let u1 = User::new("u1", "One");
        assert!(matches!(
            fx.resolver.check_access(Role::Reader, "s1", Some(&u1)).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_user_short_circuits() {
        let fx = fixture(true).await;
        // No record, no user: still owner.
        let role = fx
            .resolver
            .check_access(Role::Owner, "anything", None)
            .await
            .unwrap();
        assert_eq!(role, Role::Owner);
    }

    #[tokio::test]
    async fn test_anyone_permission_applies() {
        let fx = fixture(false).await;
        put_meta(&fx, &owned_space("s1", "u1")).await;
        let record = PermissionStore::create_record(
            "u1",
            PermissionType::Anyone,
            None,
            Role::Commenter,
            None,
        );
        fx.permissions.put(&record).await.unwrap();
        let mut meta: FileMeta = fx.meta.get_json("s1").await.unwrap();
        meta.permission_ids.push(record.key.clone());
        put_meta(&fx, &meta).await;

        let u3 = User::new("u3", "Three");
        let role = fx
            .resolver
            .check_access(Role::Reader, "s1", Some(&u3))
            .await
            .unwrap();
        assert_eq!(role, Role::Commenter);
    }
}

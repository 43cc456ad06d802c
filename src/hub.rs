//! The orchestrator.
//!
//! [`StoreHub`] wires every store together and exposes exactly one method
//! per API operation. Each method owns its access check, its writes, the
//! revision/bin/index maintenance those writes imply, and the bus
//! emission, in that order, so a client reading on receipt of an event
//! observes the new state. Writes to one key are serialized by a per-key
//! advisory lock; there is no cross-method transaction.

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::access::AccessResolver;
use crate::app::{AppFamily, AppStore};
use crate::bus::NotificationBus;
use crate::config::StoreConfig;
use crate::cursor::{CursorCodec, ListOptions, ListState};
use crate::error::{StoreError, StoreResult};
use crate::files::{AccessOperation, FileStore, RouteSet};
use crate::history::{HistoryInput, HistoryStore, HistoryType};
use crate::kv::OrderedStore;
use crate::media::MediaStore;
use crate::patch;
use crate::permissions::PermissionStore;
use crate::projects::ProjectStore;
use crate::revisions::RevisionStore;
use crate::search::SearchIndex;
use crate::sessions::SessionStore;
use crate::shared::SharedIndex;
use crate::spaces::SpaceStore;
use crate::trash::Bin;
use crate::types::{
    Alt, AppDoc, FileMeta, HistoryEntry, Media, Permission, Revision, Role, User,
};
use crate::users::UserStore;

/// One page of a listing plus the cursor for the next one.
#[derive(Debug, Clone)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub cursor: String,
}

/// Counts across the sub-stores, for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub files: usize,
    pub spaces: usize,
    pub media: usize,
    pub users: usize,
    pub sessions: usize,
    pub permissions: usize,
    pub revisions: usize,
    pub bin_items: usize,
    pub app_projects: usize,
    pub app_requests: usize,
    pub history: usize,
    pub channels: usize,
}

/// The single entry point the transport layer talks to.
pub struct StoreHub {
    config: StoreConfig,
    kv: OrderedStore,
    cursors: Arc<CursorCodec>,
    bus: Arc<NotificationBus>,
    bin: Arc<Bin>,
    users: Arc<UserStore>,
    sessions: SessionStore,
    revisions: Arc<RevisionStore>,
    media: MediaStore,
    files: FileStore,
    spaces: SpaceStore,
    projects: ProjectStore,
    app_projects: AppStore,
    app_requests: AppStore,
    history: HistoryStore,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StoreHub {
    /// Open the store, replaying the WAL when one is configured.
    pub async fn start(config: StoreConfig) -> StoreResult<Self> {
        let kv = OrderedStore::open(&config).await?;
        let cursors = Arc::new(CursorCodec::new(config.cursor_key));
        let bus = Arc::new(NotificationBus::new());
        let bin = Arc::new(Bin::new(kv.partition("bin")));
        let permissions = Arc::new(PermissionStore::new(kv.partition("permissions")));
        let shared = Arc::new(SharedIndex::new(kv.partition("shared")));
        let users = Arc::new(UserStore::new(kv.partition("users")));
        let sessions = SessionStore::new(kv.partition("sessions"));
        let revisions = Arc::new(RevisionStore::new(kv.partition("revisions")));

        let file_resolver = Arc::new(AccessResolver::new(
            kv.partition("files"),
            Arc::clone(&permissions),
            Arc::clone(&bin),
            config.single_user,
        ));
        let media = MediaStore::new(
            kv.partition("media"),
            Arc::clone(&bin),
            Arc::clone(&revisions),
            Arc::clone(&bus),
        );
        let files = FileStore::new(
            kv.partition("files"),
            Arc::clone(&permissions),
            Arc::clone(&shared),
            Arc::clone(&users),
            Arc::clone(&bin),
            Arc::clone(&file_resolver),
            Arc::clone(&bus),
            RouteSet::FILES,
        );

        let space_resolver = Arc::new(AccessResolver::new(
            kv.partition("spaces"),
            Arc::clone(&permissions),
            Arc::clone(&bin),
            config.single_user,
        ));
        let spaces = SpaceStore::new(FileStore::new(
            kv.partition("spaces"),
            Arc::clone(&permissions),
            Arc::clone(&shared),
            Arc::clone(&users),
            Arc::clone(&bin),
            Arc::clone(&space_resolver),
            Arc::clone(&bus),
            RouteSet::SPACES,
        ));
        let projects = ProjectStore::new(
            kv.partition("projects/index"),
            kv.partition("projects/data"),
            Arc::new(RevisionStore::new(kv.partition("projects/revisions"))),
            Arc::clone(&bin),
            Arc::clone(&space_resolver),
            Arc::clone(&bus),
        );

        let search = Arc::new(SearchIndex::new());
        let app_projects = AppStore::new(
            kv.partition("app/projects"),
            Arc::clone(&bus),
            AppFamily::Projects,
            Some(search),
        );
        let app_requests = AppStore::new(
            kv.partition("app/requests"),
            Arc::clone(&bus),
            AppFamily::Requests,
            None,
        );

        let history = HistoryStore::new(
            kv.partition("history/data"),
            kv.partition("history/space"),
            kv.partition("history/project"),
            kv.partition("history/request"),
            kv.partition("history/app"),
            Arc::clone(&space_resolver),
        );

        tracing::info!(
            single_user = config.single_user,
            persistent = config.data_dir.is_some(),
            "store hub started"
        );
        Ok(Self {
            config,
            kv,
            cursors,
            bus,
            bin,
            users,
            sessions,
            revisions,
            media,
            files,
            spaces,
            projects,
            app_projects,
            app_requests,
            history,
            locks: DashMap::new(),
        })
    }

    /// The notification bus, for the WebSocket layer to register channels.
    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// The bin, for recovery tooling.
    pub fn bin(&self) -> &Arc<Bin> {
        &self.bin
    }

    /// Effective role of `user` on a file, requiring at least `min_role`.
    pub async fn check_access(
        &self,
        min_role: Role,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<Role> {
        self.files.resolver().check_access(min_role, key, user).await
    }

    /// Advisory per-key write lock. Readers never take it.
    async fn lock_key(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn effective_user(&self, user: Option<&User>) -> StoreResult<User> {
        match user {
            Some(user) => Ok(user.clone()),
            None if self.config.single_user => Ok(User::default_local()),
            None => Err(StoreError::Unauthenticated),
        }
    }

    fn state(&self, options: &ListOptions) -> StoreResult<ListState> {
        self.cursors.read_list_state(options)
    }

    fn page<T>(&self, state: &ListState, items: Vec<T>, last_key: Option<String>) -> ListPage<T> {
        ListPage {
            cursor: self.cursors.encode_cursor(state, last_key.as_deref()),
            items,
        }
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// `POST /files`
    pub async fn file_create(
        &self,
        file: FileMeta,
        user: Option<&User>,
        parent: Option<&str>,
    ) -> StoreResult<FileMeta> {
        let _guard = self.lock_key(&file.key).await;
        self.files.add(file, user, parent).await
    }

    /// `POST /files/bulk`
    pub async fn file_create_bulk(
        &self,
        files: Vec<FileMeta>,
        user: Option<&User>,
        parent: Option<&str>,
    ) -> StoreResult<Vec<FileMeta>> {
        let mut created = Vec::with_capacity(files.len());
        for file in files {
            created.push(self.file_create(file, user, parent).await?);
        }
        Ok(created)
    }

    /// `GET /files/:file`
    pub async fn file_read(&self, key: &str, user: Option<&User>) -> StoreResult<FileMeta> {
        self.files.read(key, user).await
    }

    /// `GET /files`
    pub async fn files_list(
        &self,
        user: Option<&User>,
        kinds: Option<&[String]>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<FileMeta>> {
        let state = self.state(options)?;
        let (items, last_key) = self.files.list(user, kinds, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    /// `PATCH /files/:file`
    pub async fn file_patch(
        &self,
        key: &str,
        info: &JsonValue,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        let _guard = self.lock_key(key).await;
        self.files.apply_patch(key, info, user).await
    }

    /// `DELETE /files/:file`
    ///
    /// Cascades over descendants and their media before returning.
    pub async fn file_delete(&self, key: &str, user: Option<&User>) -> StoreResult<()> {
        let _guard = self.lock_key(key).await;
        let meta = self.files.delete(key, user).await?;
        self.media.delete(key, &meta.kind, user).await?;

        for descendant in self.files.descendants(key).await? {
            let kind = descendant.kind.clone();
            let child_key = descendant.key.clone();
            self.files.delete_resolved(descendant, user).await?;
            self.media.delete(&child_key, &kind, user).await?;
        }
        Ok(())
    }

    /// `PATCH /files/:file/users`
    pub async fn file_patch_access(
        &self,
        key: &str,
        ops: &[AccessOperation],
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        let _guard = self.lock_key(key).await;
        self.files.patch_access(key, ops, user).await
    }

    /// `GET /files/:file/users`
    pub async fn file_list_users(
        &self,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<Vec<Permission>> {
        let meta = self.files.read(key, user).await?;
        Ok(meta.permissions)
    }

    /// `PUT /files/:file?alt=media`
    pub async fn file_media_set(
        &self,
        key: &str,
        value: JsonValue,
        mime: &str,
        user: Option<&User>,
        allow_overwrite: bool,
    ) -> StoreResult<()> {
        self.files
            .resolver()
            .check_access(Role::Writer, key, user)
            .await?;
        let _guard = self.lock_key(key).await;
        self.media.set(key, value, mime, allow_overwrite).await
    }

    /// `GET /files/:file?alt=media`
    pub async fn file_media_read(&self, key: &str, user: Option<&User>) -> StoreResult<Media> {
        self.files
            .resolver()
            .check_access(Role::Reader, key, user)
            .await?;
        self.media.read(key, false).await
    }

    /// `PATCH /files/:file?alt=media`
    pub async fn file_media_patch(
        &self,
        key: &str,
        info: &JsonValue,
        user: Option<&User>,
    ) -> StoreResult<Revision> {
        self.files
            .resolver()
            .check_access(Role::Writer, key, user)
            .await?;
        let _guard = self.lock_key(key).await;
        let meta = self.files.resolver().read_meta(key, false).await?;
        let parsed = patch::validate(info)?;
        self.media.apply_patch(key, &meta.kind, &parsed, user).await
    }

    /// `GET /files/:project/revisions`
    pub async fn file_revisions_list(
        &self,
        key: &str,
        alt: Alt,
        user: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<Revision>> {
        self.files
            .resolver()
            .check_access(Role::Reader, key, user)
            .await?;
        let meta = self.files.resolver().read_meta(key, false).await?;
        let state = self.state(options)?;
        let (items, last_key) = self.revisions.list(&meta.kind, key, alt, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    // ------------------------------------------------------------------
    // Users & sessions
    // ------------------------------------------------------------------

    /// Provision or refresh a user record (authentication collaborator).
    pub async fn user_add(&self, user: &User) -> StoreResult<()> {
        self.users.add(user).await
    }

    /// `GET /users/:user`
    pub async fn user_read(&self, id: &str) -> StoreResult<User> {
        self.users.read(id).await
    }

    /// `GET /users`
    pub async fn users_list(
        &self,
        requesting: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<User>> {
        let state = self.state(options)?;
        let (items, last_key) = self.users.list(&state, requesting).await?;
        Ok(self.page(&state, items, last_key))
    }

    pub async fn session_set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.sessions.set(key, value).await
    }

    pub async fn session_read(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.sessions.read(key).await
    }

    pub async fn session_delete(&self, key: &str) -> StoreResult<()> {
        self.sessions.delete(key).await
    }

    // ------------------------------------------------------------------
    // App-scoped projects & requests
    // ------------------------------------------------------------------

    /// `POST /app/:appId/projects`
    pub async fn app_project_create(
        &self,
        app: &str,
        user: Option<&User>,
        data: JsonValue,
    ) -> StoreResult<AppDoc> {
        let user = self.effective_user(user)?;
        self.app_projects.create(app, &user, data).await
    }

    /// `POST /app/:appId/projects/batch/create`
    pub async fn app_project_create_batch(
        &self,
        app: &str,
        user: Option<&User>,
        items: Vec<JsonValue>,
    ) -> StoreResult<Vec<AppDoc>> {
        let user = self.effective_user(user)?;
        self.app_projects.create_batch(app, &user, items).await
    }

    /// `GET /app/:appId/projects/:key`
    pub async fn app_project_read(
        &self,
        app: &str,
        user: Option<&User>,
        key: &str,
        include_deleted: bool,
    ) -> StoreResult<AppDoc> {
        let user = self.effective_user(user)?;
        self.app_projects.read(app, &user, key, include_deleted).await
    }

    /// `POST /app/:appId/projects/batch/read`
    pub async fn app_project_read_batch(
        &self,
        app: &str,
        user: Option<&User>,
        keys: &[String],
        include_deleted: bool,
    ) -> StoreResult<Vec<Option<AppDoc>>> {
        let user = self.effective_user(user)?;
        self.app_projects
            .read_batch(app, &user, keys, include_deleted)
            .await
    }

    /// `GET /app/:appId/projects`
    pub async fn app_projects_list(
        &self,
        app: &str,
        user: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<AppDoc>> {
        let user = self.effective_user(user)?;
        let state = self.state(options)?;
        let (items, last_key) = self.app_projects.list(app, &user, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    /// `PATCH /app/:appId/projects/:key`
    pub async fn app_project_patch(
        &self,
        app: &str,
        user: Option<&User>,
        key: &str,
        info: &JsonValue,
    ) -> StoreResult<AppDoc> {
        let user = self.effective_user(user)?;
        self.app_projects.apply_patch(app, &user, key, info).await
    }

    /// `POST /app/:appId/projects/batch/delete`
    pub async fn app_project_delete_batch(
        &self,
        app: &str,
        user: Option<&User>,
        keys: &[String],
    ) -> StoreResult<()> {
        let user = self.effective_user(user)?;
        self.app_projects.delete_batch(app, &user, keys).await
    }

    /// `POST /app/:appId/projects/batch/undelete`
    pub async fn app_project_undelete_batch(
        &self,
        app: &str,
        user: Option<&User>,
        keys: &[String],
    ) -> StoreResult<()> {
        let user = self.effective_user(user)?;
        self.app_projects.undelete_batch(app, &user, keys).await
    }

    /// `GET /app/:appId/query/projects`
    pub async fn app_projects_query(
        &self,
        app: &str,
        user: Option<&User>,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<AppDoc>> {
        let user = self.effective_user(user)?;
        self.app_projects.query(app, &user, query, limit).await
    }

    /// `POST /app/:appId/requests` and friends.
    pub async fn app_request_create(
        &self,
        app: &str,
        user: Option<&User>,
        data: JsonValue,
    ) -> StoreResult<AppDoc> {
        let user = self.effective_user(user)?;
        self.app_requests.create(app, &user, data).await
    }

    pub async fn app_request_create_batch(
        &self,
        app: &str,
        user: Option<&User>,
        items: Vec<JsonValue>,
    ) -> StoreResult<Vec<AppDoc>> {
        let user = self.effective_user(user)?;
        self.app_requests.create_batch(app, &user, items).await
    }

    pub async fn app_request_read_batch(
        &self,
        app: &str,
        user: Option<&User>,
        keys: &[String],
        include_deleted: bool,
    ) -> StoreResult<Vec<Option<AppDoc>>> {
        let user = self.effective_user(user)?;
        self.app_requests
            .read_batch(app, &user, keys, include_deleted)
            .await
    }

    pub async fn app_requests_list(
        &self,
        app: &str,
        user: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<AppDoc>> {
        let user = self.effective_user(user)?;
        let state = self.state(options)?;
        let (items, last_key) = self.app_requests.list(app, &user, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    pub async fn app_request_patch(
        &self,
        app: &str,
        user: Option<&User>,
        key: &str,
        info: &JsonValue,
    ) -> StoreResult<AppDoc> {
        let user = self.effective_user(user)?;
        self.app_requests.apply_patch(app, &user, key, info).await
    }

    pub async fn app_request_delete_batch(
        &self,
        app: &str,
        user: Option<&User>,
        keys: &[String],
    ) -> StoreResult<()> {
        let user = self.effective_user(user)?;
        self.app_requests.delete_batch(app, &user, keys).await
    }

    pub async fn app_request_undelete_batch(
        &self,
        app: &str,
        user: Option<&User>,
        keys: &[String],
    ) -> StoreResult<()> {
        let user = self.effective_user(user)?;
        self.app_requests.undelete_batch(app, &user, keys).await
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub async fn history_add(
        &self,
        input: HistoryInput,
        user: Option<&User>,
    ) -> StoreResult<HistoryEntry> {
        let user = self.effective_user(user)?;
        self.history.add(input, &user).await
    }

    pub async fn history_list(
        &self,
        typ: HistoryType,
        selector: Option<&str>,
        user: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<HistoryEntry>> {
        let user = self.effective_user(user)?;
        let state = self.state(options)?;
        let (items, last_key) = self.history.list(typ, selector, &user, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    pub async fn history_query(
        &self,
        typ: HistoryType,
        selector: Option<&str>,
        user: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<HistoryEntry>> {
        let user = self.effective_user(user)?;
        let state = self.state(options)?;
        let (items, last_key) = self.history.query(typ, selector, &user, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    pub async fn history_read(
        &self,
        encoded_key: &str,
        user: Option<&User>,
    ) -> StoreResult<HistoryEntry> {
        let user = self.effective_user(user)?;
        self.history.read(encoded_key, &user).await
    }

    // ------------------------------------------------------------------
    // Legacy spaces & projects
    // ------------------------------------------------------------------

    pub async fn space_create(
        &self,
        space: FileMeta,
        user: Option<&User>,
        parent: Option<&str>,
    ) -> StoreResult<FileMeta> {
        let _guard = self.lock_key(&space.key).await;
        self.spaces.add(space, user, parent).await
    }

    pub async fn space_read(&self, key: &str, user: Option<&User>) -> StoreResult<FileMeta> {
        self.spaces.read(key, user).await
    }

    pub async fn spaces_list(
        &self,
        user: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<FileMeta>> {
        let state = self.state(options)?;
        let (items, last_key) = self.spaces.list(user, None, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    pub async fn space_patch(
        &self,
        key: &str,
        info: &JsonValue,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        let _guard = self.lock_key(key).await;
        self.spaces.apply_patch(key, info, user).await
    }

    /// Cascades over the space's legacy projects.
    pub async fn space_delete(&self, key: &str, user: Option<&User>) -> StoreResult<()> {
        let _guard = self.lock_key(key).await;
        self.spaces.delete(key, user).await?;
        self.projects.delete_for_space(key, user).await
    }

    pub async fn space_patch_access(
        &self,
        key: &str,
        ops: &[AccessOperation],
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        let _guard = self.lock_key(key).await;
        self.spaces.patch_access(key, ops, user).await
    }

    pub async fn space_project_create(
        &self,
        space: &str,
        key: &str,
        name: &str,
        contents: JsonValue,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        let _guard = self.lock_key(key).await;
        self.projects.add(space, key, name, contents, user).await
    }

    pub async fn space_project_read(
        &self,
        space: &str,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<FileMeta> {
        self.projects.read_meta(space, key, user).await
    }

    pub async fn space_project_media(
        &self,
        space: &str,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<Media> {
        self.projects.read_media(space, key, user).await
    }

    pub async fn space_projects_list(
        &self,
        space: &str,
        user: Option<&User>,
        options: &ListOptions,
    ) -> StoreResult<ListPage<FileMeta>> {
        let state = self.state(options)?;
        let (items, last_key) = self.projects.list(space, user, &state).await?;
        Ok(self.page(&state, items, last_key))
    }

    pub async fn space_project_patch(
        &self,
        space: &str,
        key: &str,
        info: &JsonValue,
        user: Option<&User>,
    ) -> StoreResult<Revision> {
        let _guard = self.lock_key(key).await;
        self.projects.apply_patch(space, key, info, user).await
    }

    pub async fn space_project_delete(
        &self,
        space: &str,
        key: &str,
        user: Option<&User>,
    ) -> StoreResult<()> {
        let _guard = self.lock_key(key).await;
        self.projects.delete(space, key, user).await
    }

    // ------------------------------------------------------------------
    // Diagnostics & lifecycle
    // ------------------------------------------------------------------

    /// Counts across the sub-stores and the bus.
    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            files: self.kv.partition("files").count().await,
            spaces: self.kv.partition("spaces").count().await,
            media: self.kv.partition("media").count().await,
            users: self.kv.partition("users").count().await,
            sessions: self.kv.partition("sessions").count().await,
            permissions: self.kv.partition("permissions").count().await,
            revisions: self.kv.partition("revisions").count().await,
            bin_items: self.kv.partition("bin").count().await,
            app_projects: self.kv.partition("app/projects").count().await,
            app_requests: self.kv.partition("app/requests").count().await,
            history: self.kv.partition("history/data").count().await,
            channels: self.bus.total(),
        }
    }

    /// Close every channel and flush the WAL.
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.bus.close_all().await;
        self.kv.flush().await?;
        tracing::info!("store hub stopped");
        Ok(())
    }
}

//! Content storage for file bodies.
//!
//! One media record per file key, holding the JSON value and its MIME
//! type. Content patches run through the patch engine and always append a
//! revision carrying the revert patch; events fan out on the media URL so
//! clients watching the content see both the revision and the change.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::bus::{urls, ChannelFilter, Event, NotificationBus, Operation};
use crate::error::{StoreError, StoreResult};
use crate::kv::SubStore;
use crate::patch::{self, PatchInfo};
use crate::revisions::RevisionStore;
use crate::trash::Bin;
use crate::types::{Media, Revision, User, KIND_REVISION};

pub struct MediaStore {
    sub: Arc<SubStore>,
    bin: Arc<Bin>,
    revisions: Arc<RevisionStore>,
    bus: Arc<NotificationBus>,
}

impl MediaStore {
    pub fn new(
        sub: Arc<SubStore>,
        bin: Arc<Bin>,
        revisions: Arc<RevisionStore>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            sub,
            bin,
            revisions,
            bus,
        }
    }

    /// Write contents for `key`.
    ///
    /// With `allow_overwrite` off an existing record fails `AlreadyExists`.
    pub async fn set(
        &self,
        key: &str,
        value: JsonValue,
        mime: &str,
        allow_overwrite: bool,
    ) -> StoreResult<()> {
        if !allow_overwrite && self.sub.has(key).await {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        let media = Media {
            value,
            mime: mime.to_string(),
            deleted: None,
        };
        self.sub.put_json(key, &media).await
    }

    /// Read contents. Soft-deleted records surface `NotFound` unless the
    /// caller explicitly asks for deleted items (internal use only).
    pub async fn read(&self, key: &str, include_deleted: bool) -> StoreResult<Media> {
        let media: Media = self
            .sub
            .get_json(key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if media.is_deleted() && !include_deleted {
            return Err(StoreError::not_found(key));
        }
        Ok(media)
    }

    /// Whether a record exists, deleted or not.
    pub async fn has(&self, key: &str) -> bool {
        self.sub.has(key).await
    }

    /// Soft-delete the contents of `key` and record it in the bin.
    pub async fn delete(&self, key: &str, kind: &str, user: Option<&User>) -> StoreResult<()> {
        let mut media = match self.read(key, true).await {
            Ok(media) => media,
            // No contents were ever written; nothing to delete.
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };
        if media.is_deleted() {
            return Ok(());
        }
        media.deleted = Some(true);
        self.sub.put_json(key, &media).await?;
        self.bin.add(&format!("{kind}-media"), key, user).await?;

        let event = Event::new(Operation::Deleted, kind).with_id(key);
        self.bus
            .notify(&event, &ChannelFilter::url(urls::file_media(key)))
            .await;
        Ok(())
    }

    /// Clear the soft-delete marker. Internal; runs during undeletes.
    pub async fn undelete(&self, key: &str, kind: &str) -> StoreResult<()> {
        let mut media = self.read(key, true).await?;
        if !media.is_deleted() {
            return Ok(());
        }
        media.deleted = None;
        self.sub.put_json(key, &media).await?;
        self.bin.remove(&format!("{kind}-media"), key).await
    }

    /// Apply a validated content patch.
    ///
    /// Writes the patched value, appends a revision, and emits a
    /// `created` for the revision followed by a `patch` for the media.
    pub async fn apply_patch(
        &self,
        key: &str,
        kind: &str,
        info: &PatchInfo,
        _user: Option<&User>,
    ) -> StoreResult<Revision> {
        let mut media = self.read(key, false).await?;
        let (patched, revert) = patch::apply(&media.value, &info.patch)?;
        media.value = patched;
        self.sub.put_json(key, &media).await?;

        let revision = self.revisions.add(kind, key, &info.patch, &revert).await?;

        let media_url = urls::file_media(key);
        let created = Event::new(Operation::Created, KIND_REVISION)
            .with_id(revision.id.clone())
            .with_data(serde_json::to_value(&revision)?);
        self.bus
            .notify(&created, &ChannelFilter::url(media_url.clone()))
            .await;
        self.bus
            .notify(&created, &ChannelFilter::url(urls::file_revisions(key)))
            .await;

        let patched_event = Event::new(Operation::Patch, kind)
            .with_id(key)
            .with_data(serde_json::to_value(&info.patch)?);
        self.bus
            .notify(&patched_event, &ChannelFilter::url(media_url))
            .await;
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::kv::OrderedStore;
    use crate::bus::QueueSink;
    use crate::types::KIND_HTTP_PROJECT;
    use serde_json::json;

    struct Fixture {
        media: MediaStore,
        bin: Arc<Bin>,
        bus: Arc<NotificationBus>,
    }

    async fn fixture() -> Fixture {
        let store = OrderedStore::open(&StoreConfig::in_memory()).await.unwrap();
        let bin = Arc::new(Bin::new(store.partition("bin")));
        let revisions = Arc::new(RevisionStore::new(store.partition("revisions")));
        let bus = Arc::new(NotificationBus::new());
        let media = MediaStore::new(
            store.partition("media"),
            Arc::clone(&bin),
            revisions,
            Arc::clone(&bus),
        );
        Fixture { media, bin, bus }
    }

    fn patch_info(value: JsonValue) -> PatchInfo {
        patch::validate(&json!({
            "app": "tests",
            "appVersion": "1.0.0",
            "id": "pp-1",
            "patch": [{ "op": "replace", "path": "/info/name", "value": value }],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_set_and_read() {
        let fx = fixture().await;
        fx.media
            .set("p1", json!({"info": {"name": "p1"}}), "application/json", true)
            .await
            .unwrap();
        let media = fx.media.read("p1", false).await.unwrap();
        assert_eq!(media.mime, "application/json");
        assert_eq!(media.value["info"]["name"], "p1");
    }

    #[tokio::test]
    async fn test_overwrite_guard() {
        let fx = fixture().await;
        fx.media
            .set("p1", json!(1), "application/json", true)
            .await
            .unwrap();
        assert!(matches!(
            fx.media.set("p1", json!(2), "application/json", false).await,
            Err(StoreError::AlreadyExists { .. })
        ));
        // Overwrite allowed by default.
        fx.media
            .set("p1", json!(2), "application/json", true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_masks_read_and_records_bin() {
        let fx = fixture().await;
        let user = User::new("u1", "One");
        fx.media
            .set("p1", json!({}), "application/json", true)
            .await
            .unwrap();
        fx.media
            .delete("p1", KIND_HTTP_PROJECT, Some(&user))
            .await
            .unwrap();

        assert!(matches!(
            fx.media.read("p1", false).await,
            Err(StoreError::NotFound { .. })
        ));
        // Internal callers can still reach the record.
        assert!(fx.media.read("p1", true).await.is_ok());
        assert!(fx.bin.is_deleted("HttpProject-media", "p1").await);
    }

    #[tokio::test]
    async fn test_patch_appends_revision_and_emits_events() {
        let fx = fixture().await;
        fx.media
            .set("p1", json!({"info": {"name": "p1"}}), "application/json", true)
            .await
            .unwrap();

        let (sink, mut rx) = QueueSink::pair();
        fx.bus.register(sink, urls::file_media("p1"), None, None);

        let info = patch_info(json!("New"));
        let revision = fx
            .media
            .apply_patch("p1", KIND_HTTP_PROJECT, &info, None)
            .await
            .unwrap();

        let media = fx.media.read("p1", false).await.unwrap();
        assert_eq!(media.value["info"]["name"], "New");

        // Revert restores the original name.
        let (restored, _) = patch::apply(&media.value, &revision.revert).unwrap();
        assert_eq!(restored["info"]["name"], "p1");

        let first: JsonValue = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["operation"], "created");
        assert_eq!(first["kind"], "Revision");
        let second: JsonValue = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(second["operation"], "patch");
        assert_eq!(second["kind"], "HttpProject");
        assert_eq!(second["id"], "p1");
    }

    #[tokio::test]
    async fn test_patch_on_deleted_media_fails() {
        let fx = fixture().await;
        fx.media
            .set("p1", json!({"info": {"name": "p1"}}), "application/json", true)
            .await
            .unwrap();
        fx.media.delete("p1", KIND_HTTP_PROJECT, None).await.unwrap();

        let info = patch_info(json!("New"));
        assert!(matches!(
            fx.media
                .apply_patch("p1", KIND_HTTP_PROJECT, &info, None)
                .await,
            Err(StoreError::NotFound { .. })
        ));
    }
}

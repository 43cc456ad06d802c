//! App-scoped project and request stores.
//!
//! Records live under the `(appId, userKey)` scope baked into their keys;
//! nothing ever crosses that boundary. Both families share the same
//! surface — batch CRUD, soft delete, undelete — and the project family
//! additionally feeds the full-text index.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::bus::{urls, ChannelFilter, Event, NotificationBus, Operation};
use crate::cursor::ListState;
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::kv::{IterateOptions, SubStore};
use crate::patch;
use crate::search::{scope_tag, SearchIndex};
use crate::types::{now_millis, AppDoc, AppDocMeta, User, KIND_APP_PROJECT, KIND_APP_REQUEST};
use uuid::Uuid;

/// Paths app patches may not touch: record identity and the scope meta.
const APP_GUARDS: &[&str] = &["/key", "/kind", "/meta"];

/// Which app family a store instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppFamily {
    Projects,
    Requests,
}

impl AppFamily {
    fn kind(&self) -> &'static str {
        match self {
            AppFamily::Projects => KIND_APP_PROJECT,
            AppFamily::Requests => KIND_APP_REQUEST,
        }
    }

    fn record_key(&self, app: &str, user: &str, key: &str) -> StoreResult<String> {
        match self {
            AppFamily::Projects => keys::app_project(app, user, key),
            AppFamily::Requests => keys::app_request(app, user, key),
        }
    }

    fn scope_prefix(&self, app: &str, user: &str) -> StoreResult<String> {
        match self {
            AppFamily::Projects => keys::app_projects_prefix(app, user),
            AppFamily::Requests => keys::app_requests_prefix(app, user),
        }
    }

    fn collection_url(&self, app: &str) -> String {
        match self {
            AppFamily::Projects => urls::app_projects(app),
            AppFamily::Requests => urls::app_requests(app),
        }
    }
}

/// Store for one app family.
pub struct AppStore {
    sub: Arc<SubStore>,
    bus: Arc<NotificationBus>,
    family: AppFamily,
    /// Present on the project family only.
    index: Option<Arc<SearchIndex>>,
}

impl AppStore {
    pub fn new(
        sub: Arc<SubStore>,
        bus: Arc<NotificationBus>,
        family: AppFamily,
        index: Option<Arc<SearchIndex>>,
    ) -> Self {
        Self {
            sub,
            bus,
            family,
            index,
        }
    }

    /// Create one record. The key comes from `data.key` or is generated;
    /// `created`/`updated` stamps are filled in when absent.
    pub async fn create(&self, app: &str, user: &User, data: JsonValue) -> StoreResult<AppDoc> {
        let docs = self.create_batch(app, user, vec![data]).await?;
        Ok(docs.into_iter().next().expect("one input, one output"))
    }

    /// Create many records in input order.
    pub async fn create_batch(
        &self,
        app: &str,
        user: &User,
        items: Vec<JsonValue>,
    ) -> StoreResult<Vec<AppDoc>> {
        let mut created = Vec::with_capacity(items.len());
        for mut data in items {
            if !data.is_object() {
                return Err(StoreError::invalid("record data must be an object"));
            }
            let key = match data.get("key").and_then(JsonValue::as_str) {
                Some(key) => key.to_string(),
                None => {
                    let key = Uuid::new_v4().to_string();
                    data["key"] = JsonValue::String(key.clone());
                    key
                }
            };
            let record_key = self.family.record_key(app, &user.key, &key)?;
            if self.sub.has(&record_key).await {
                return Err(StoreError::AlreadyExists { key });
            }
            let now = now_millis();
            if data.get("created").and_then(JsonValue::as_i64).is_none() {
                data["created"] = JsonValue::from(now);
            }
            if data.get("updated").and_then(JsonValue::as_i64).is_none() {
                data["updated"] = JsonValue::from(now);
            }
            let doc = AppDoc {
                meta: AppDocMeta {
                    app_id: app.to_string(),
                    user: user.key.clone(),
                    deleted: None,
                },
                data,
            };
            self.sub.put_json(&record_key, &doc).await?;
            self.maintain_index(app, user, &key, Some(&doc.data));

            let event = Event::new(Operation::Created, self.family.kind())
                .with_id(&key)
                .with_data(doc.data.clone());
            self.notify_scope(app, user, event).await;
            created.push(doc);
        }
        Ok(created)
    }

    /// Read one record.
    pub async fn read(
        &self,
        app: &str,
        user: &User,
        key: &str,
        include_deleted: bool,
    ) -> StoreResult<AppDoc> {
        let record_key = self.family.record_key(app, &user.key, key)?;
        let doc: AppDoc = self
            .sub
            .get_json(&record_key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if doc.is_deleted() && !include_deleted {
            return Err(StoreError::not_found(key));
        }
        Ok(doc)
    }

    /// Read many records, preserving input order. Slots that are missing
    /// or deleted (without `include_deleted`) come back as `None`.
    pub async fn read_batch(
        &self,
        app: &str,
        user: &User,
        keys: &[String],
        include_deleted: bool,
    ) -> StoreResult<Vec<Option<AppDoc>>> {
        let mut record_keys = Vec::with_capacity(keys.len());
        for key in keys {
            record_keys.push(self.family.record_key(app, &user.key, key)?);
        }
        let docs: Vec<Option<AppDoc>> = self.sub.get_many_json(&record_keys).await?;
        Ok(docs
            .into_iter()
            .map(|slot| slot.filter(|doc| include_deleted || !doc.is_deleted()))
            .collect())
    }

    /// List live records of the scope in reverse order.
    pub async fn list(
        &self,
        app: &str,
        user: &User,
        state: &ListState,
    ) -> StoreResult<(Vec<AppDoc>, Option<String>)> {
        let prefix = self.family.scope_prefix(app, &user.key)?;
        let (gte, mut lte) = keys::prefix_range(&prefix);
        if let Some(last) = &state.last_key {
            if last.as_str() >= gte.as_str() && last.as_str() <= lte.as_str() {
                lte = last.clone();
            }
        }
        let mut iter = self.sub.iterate(
            IterateOptions {
                gte: Some(gte),
                lte: Some(lte),
                ..Default::default()
            }
            .reversed(),
        );
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
            let doc: AppDoc = serde_json::from_slice(&bytes)?;
            if doc.is_deleted() {
                continue;
            }
            last_key = Some(entry.key);
            items.push(doc);
        }
        Ok((items, last_key))
    }

    /// Patch one record's data.
    pub async fn apply_patch(
        &self,
        app: &str,
        user: &User,
        key: &str,
        info: &JsonValue,
    ) -> StoreResult<AppDoc> {
        let parsed = patch::validate_with_guards(info, APP_GUARDS)?;
        let record_key = self.family.record_key(app, &user.key, key)?;
        let mut doc: AppDoc = self
            .sub
            .get_json(&record_key)
            .await
            .map_err(|_| StoreError::not_found(key))?;
        if doc.is_deleted() {
            return Err(StoreError::not_found(key));
        }
        let (patched, _revert) = patch::apply(&doc.data, &parsed.patch)?;
        doc.data = patched;
        doc.data["updated"] = JsonValue::from(now_millis());
        self.sub.put_json(&record_key, &doc).await?;
        self.maintain_index(app, user, key, Some(&doc.data));

        let event = Event::new(Operation::Patch, self.family.kind())
            .with_id(key)
            .with_data(serde_json::to_value(&parsed.patch)?);
        self.notify_scope(app, user, event).await;
        Ok(doc)
    }

    /// Soft-delete records. Unknown keys are skipped; re-deleting is a
    /// no-op.
    pub async fn delete_batch(&self, app: &str, user: &User, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            let record_key = self.family.record_key(app, &user.key, key)?;
            let Ok(mut doc) = self.sub.get_json::<AppDoc>(&record_key).await else {
                continue;
            };
            if doc.is_deleted() {
                continue;
            }
            doc.meta.deleted = Some(true);
            self.sub.put_json(&record_key, &doc).await?;
            self.maintain_index(app, user, key, None);

            let event = Event::new(Operation::Deleted, self.family.kind()).with_id(key);
            self.notify_scope(app, user, event).await;
        }
        Ok(())
    }

    /// Clear the soft-delete marker on records.
    pub async fn undelete_batch(&self, app: &str, user: &User, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            let record_key = self.family.record_key(app, &user.key, key)?;
            let Ok(mut doc) = self.sub.get_json::<AppDoc>(&record_key).await else {
                continue;
            };
            if !doc.is_deleted() {
                continue;
            }
            doc.meta.deleted = None;
            self.sub.put_json(&record_key, &doc).await?;
            self.maintain_index(app, user, key, Some(&doc.data));

            let event = Event::new(Operation::Created, self.family.kind())
                .with_id(key)
                .with_data(doc.data.clone());
            self.notify_scope(app, user, event).await;
        }
        Ok(())
    }

    /// Full-text query over the scope (project family only).
    ///
    /// The first query of a scope streams its stored documents into the
    /// index; later calls hit the warmed index.
    pub async fn query(
        &self,
        app: &str,
        user: &User,
        text: &str,
        limit: usize,
    ) -> StoreResult<Vec<AppDoc>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| StoreError::invalid("this family does not support queries"))?;
        let tag = scope_tag(app, &user.key);
        if !index.is_warm(&tag) {
            let mut docs: Vec<(String, JsonValue)> = Vec::new();
            let prefix = self.family.scope_prefix(app, &user.key)?;
            let mut iter = self.sub.iterate(IterateOptions::prefix(&prefix));
            while let Some(entry) = iter.next().await {
                let Some(bytes) = entry.value else { continue };
                let doc: AppDoc = serde_json::from_slice(&bytes)?;
                if doc.is_deleted() {
                    continue;
                }
                let Some(key) = doc.data_key().map(str::to_string) else {
                    continue;
                };
                docs.push((key, doc.data));
            }
            index.warm_with(&tag, docs.iter().map(|(k, d)| (k.as_str(), d)));
        }

        let keys = index.query(&tag, text, limit);
        let docs = self.read_batch(app, user, &keys, false).await?;
        Ok(docs.into_iter().flatten().collect())
    }

    fn maintain_index(&self, app: &str, user: &User, key: &str, data: Option<&JsonValue>) {
        if let Some(index) = &self.index {
            let tag = scope_tag(app, &user.key);
            match data {
                Some(data) => index.maintain(&tag, key, data),
                None => index.remove(&tag, key),
            }
        }
    }

    async fn notify_scope(&self, app: &str, user: &User, event: Event) {
        let filter = ChannelFilter::url(self.family.collection_url(app))
            .for_users(vec![user.key.clone()]);
        self.bus.notify(&event, &filter).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::cursor::{CursorCodec, ListOptions};
    use crate::kv::OrderedStore;
    use serde_json::json;

    async fn projects() -> AppStore {
        let store = OrderedStore::open(&StoreConfig::in_memory()).await.unwrap();
        AppStore::new(
            store.partition("app/projects"),
            Arc::new(NotificationBus::new()),
            AppFamily::Projects,
            Some(Arc::new(SearchIndex::new())),
        )
    }

    fn doc(key: &str, name: &str) -> JsonValue {
        json!({ "key": key, "info": { "name": name } })
    }

    #[tokio::test]
    async fn test_create_stamps_and_rejects_duplicates() {
        let store = projects().await;
        let u1 = User::new("u1", "One");

        let created = store.create("A", &u1, doc("p1", "One")).await.unwrap();
        assert!(created.data["created"].is_i64());
        assert!(created.data["updated"].is_i64());
        assert_eq!(created.meta.app_id, "A");

        assert!(matches!(
            store.create("A", &u1, doc("p1", "Again")).await,
            Err(StoreError::AlreadyExists { .. })
        ));

        // Missing keys are generated.
        let generated = store
            .create("A", &u1, json!({ "info": { "name": "keyless" } }))
            .await
            .unwrap();
        assert!(generated.data_key().is_some());
    }

    #[tokio::test]
    async fn test_scope_isolation() {
        let store = projects().await;
        let u1 = User::new("u1", "One");
        let u2 = User::new("u2", "Two");

        store.create("A", &u1, doc("p1", "A-one")).await.unwrap();
        store.create("B", &u1, doc("p2", "B-one")).await.unwrap();

        // Same user, other app.
        assert!(store.read("B", &u1, "p1", false).await.is_err());
        // Same app, other user.
        assert!(store.read("A", &u2, "p1", false).await.is_err());

        let codec = CursorCodec::new(Some([1u8; 32]));
        let state = codec.read_list_state(&ListOptions::default()).unwrap();
        let (items, _) = store.list("A", &u1, &state).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data_key(), Some("p1"));
    }

    #[tokio::test]
    async fn test_read_batch_preserves_order_with_holes() {
        let store = projects().await;
        let u1 = User::new("u1", "One");
        store.create("A", &u1, doc("p1", "One")).await.unwrap();
        store.create("A", &u1, doc("p3", "Three")).await.unwrap();
        store
            .delete_batch("A", &u1, &["p3".to_string()])
            .await
            .unwrap();

        let got = store
            .read_batch(
                "A",
                &u1,
                &["p1".to_string(), "p2".to_string(), "p3".to_string()],
                false,
            )
            .await
            .unwrap();
        assert!(got[0].is_some());
        assert!(got[1].is_none());
        assert!(got[2].is_none());

        // Deleted slots come back when explicitly requested.
        let got = store
            .read_batch("A", &u1, &["p3".to_string()], true)
            .await
            .unwrap();
        assert!(got[0].as_ref().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_delete_undelete_round_trip() {
        let store = projects().await;
        let u1 = User::new("u1", "One");
        store.create("A", &u1, doc("p1", "One")).await.unwrap();

        store
            .delete_batch("A", &u1, &["p1".to_string()])
            .await
            .unwrap();
        assert!(store.read("A", &u1, "p1", false).await.is_err());

        store
            .undelete_batch("A", &u1, &["p1".to_string()])
            .await
            .unwrap();
        let doc = store.read("A", &u1, "p1", false).await.unwrap();
        assert!(!doc.is_deleted());

        // Both directions tolerate unknown keys.
        store
            .delete_batch("A", &u1, &["ghost".to_string()])
            .await
            .unwrap();
        store
            .undelete_batch("A", &u1, &["ghost".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_patch_guards_meta() {
        let store = projects().await;
        let u1 = User::new("u1", "One");
        store.create("A", &u1, doc("p1", "One")).await.unwrap();

        let info = json!({
            "app": "tests", "appVersion": "1.0.0", "id": "pp-1",
            "patch": [{ "op": "replace", "path": "/meta/user", "value": "u2" }],
        });
        assert!(store.apply_patch("A", &u1, "p1", &info).await.is_err());

        let info = json!({
            "app": "tests", "appVersion": "1.0.0", "id": "pp-2",
            "patch": [{ "op": "replace", "path": "/info/name", "value": "Renamed" }],
        });
        let patched = store.apply_patch("A", &u1, "p1", &info).await.unwrap();
        assert_eq!(patched.data["info"]["name"], "Renamed");
    }

    #[tokio::test]
    async fn test_query_scoped_and_warmed_lazily() {
        let store = projects().await;
        let u1 = User::new("u1", "One");
        store
            .create("A", &u1, doc("p1", "Payments backend"))
            .await
            .unwrap();
        store
            .create("B", &u1, doc("p2", "Billing backend"))
            .await
            .unwrap();

        // First query warms scope A from storage.
        let hits = store.query("A", &u1, "payments", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data_key(), Some("p1"));

        // Names from scope B never match in scope A.
        assert!(store.query("A", &u1, "billing", 10).await.unwrap().is_empty());

        // Deletion drops the document from the warmed index.
        store
            .delete_batch("A", &u1, &["p1".to_string()])
            .await
            .unwrap();
        assert!(store.query("A", &u1, "payments", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reverse_paginates() {
        let store = projects().await;
        let u1 = User::new("u1", "One");
        for i in 0..5 {
            store
                .create("A", &u1, doc(&format!("p{i}"), &format!("P {i}")))
                .await
                .unwrap();
        }
        let codec = CursorCodec::new(Some([1u8; 32]));
        let state = codec.read_list_state(&ListOptions::limit(3)).unwrap();
        let (page1, last1) = store.list("A", &u1, &state).await.unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page1[0].data_key(), Some("p4"));

        let token = codec.encode_cursor(&state, last1.as_deref());
        let state2 = codec.read_list_state(&ListOptions::cursor(token)).unwrap();
        let (page2, _) = store.list("A", &u1, &state2).await.unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].data_key(), Some("p1"));
        assert_eq!(page2[1].data_key(), Some("p0"));
    }

    #[tokio::test]
    async fn test_requests_family_has_no_query() {
        let store = {
            let kv = OrderedStore::open(&StoreConfig::in_memory()).await.unwrap();
            AppStore::new(
                kv.partition("app/requests"),
                Arc::new(NotificationBus::new()),
                AppFamily::Requests,
                None,
            )
        };
        let u1 = User::new("u1", "One");
        store.create("A", &u1, doc("r1", "Request")).await.unwrap();
        assert!(matches!(
            store.query("A", &u1, "request", 10).await,
            Err(StoreError::InvalidInput { .. })
        ));
    }
}

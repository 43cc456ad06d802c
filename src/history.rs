//! HTTP request/response traces.
//!
//! The body of every trace lives in the `history/data` partition under a
//! time-prefixed key that already carries the writing user; the `space`,
//! `project`, `request`, and `app` partitions hold forward pointers (their
//! values are the data key). User listings scan the data partition
//! directly; the other types scan their pointer partition newest-first and
//! dereference. Both apply caller-identity and space-access filters.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::access::AccessResolver;
use crate::cursor::ListState;
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::kv::{IterateOptions, SubStore};
use crate::types::{now_millis, HistoryEntry, HistoryLog, Role, User};

/// Which pointer partition a listing walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryType {
    User,
    Space,
    Project,
    Request,
    App,
}

/// Payload accepted by [`HistoryStore::add`].
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryInput {
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

/// URL-safe encoding of a history key, used in routes.
pub fn encode_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

fn decode_key(encoded: &str) -> StoreResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| StoreError::invalid("malformed history key"))?;
    String::from_utf8(bytes).map_err(|_| StoreError::invalid("malformed history key"))
}

pub struct HistoryStore {
    data: Arc<SubStore>,
    by_space: Arc<SubStore>,
    by_project: Arc<SubStore>,
    by_request: Arc<SubStore>,
    by_app: Arc<SubStore>,
    /// Space access checks resolve against the legacy space family.
    resolver: Arc<AccessResolver>,
}

impl HistoryStore {
    pub fn new(
        data: Arc<SubStore>,
        by_space: Arc<SubStore>,
        by_project: Arc<SubStore>,
        by_request: Arc<SubStore>,
        by_app: Arc<SubStore>,
        resolver: Arc<AccessResolver>,
    ) -> Self {
        Self {
            data,
            by_space,
            by_project,
            by_request,
            by_app,
            resolver,
        }
    }

    /// Append one trace and index it.
    pub async fn add(&self, input: HistoryInput, user: &User) -> StoreResult<HistoryEntry> {
        // Microsecond precision keeps concurrent writes from colliding on
        // the time-prefixed key.
        let time = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
        let data_key = keys::history_data(&time, &user.key)?;
        let entry = HistoryEntry {
            key: data_key.clone(),
            created: now_millis(),
            user: user.key.clone(),
            app: input.app.clone(),
            space: input.space.clone(),
            project: input.project.clone(),
            request: input.request.clone(),
            log: input.log,
        };
        self.data.put_json(&data_key, &entry).await?;

        let pointer = serde_json::to_vec(&JsonValue::String(data_key.clone()))?;
        if let Some(space) = &input.space {
            self.by_space
                .put(&keys::history_index("space", &time, space, &user.key)?, &pointer)
                .await?;
        }
        if let Some(project) = &input.project {
            self.by_project
                .put(
                    &keys::history_index("project", &time, project, &user.key)?,
                    &pointer,
                )
                .await?;
        }
        if let Some(request) = &input.request {
            self.by_request
                .put(
                    &keys::history_index("request", &time, request, &user.key)?,
                    &pointer,
                )
                .await?;
        }
        if let Some(app) = &input.app {
            self.by_app
                .put(&keys::history_index("app", &time, app, &user.key)?, &pointer)
                .await?;
        }
        Ok(entry)
    }

    /// List traces of one type, newest first.
    ///
    /// Own traces only, except space listings: with `reader` on the
    /// selector space the caller sees every user's traces in that space.
    pub async fn list(
        &self,
        typ: HistoryType,
        selector: Option<&str>,
        user: &User,
        state: &ListState,
    ) -> StoreResult<(Vec<HistoryEntry>, Option<String>)> {
        self.scan(typ, selector, user, state, None).await
    }

    /// Full-text search over traces of one type, newest first.
    ///
    /// Matches substrings case-insensitively in the request URL, headers,
    /// HTTP message, and payload, and the response headers and payload.
    pub async fn query(
        &self,
        typ: HistoryType,
        selector: Option<&str>,
        user: &User,
        state: &ListState,
    ) -> StoreResult<(Vec<HistoryEntry>, Option<String>)> {
        let needle = state
            .query
            .as_deref()
            .map(str::to_lowercase)
            .ok_or_else(|| StoreError::invalid("missing query"))?;
        self.scan(typ, selector, user, state, Some(&needle)).await
    }

    /// Read one trace by its URL-encoded key.
    pub async fn read(&self, encoded_key: &str, user: &User) -> StoreResult<HistoryEntry> {
        let key = decode_key(encoded_key)?;
        let entry: HistoryEntry = self
            .data
            .get_json(&key)
            .await
            .map_err(|_| StoreError::not_found(encoded_key))?;
        if entry.user == user.key {
            return Ok(entry);
        }
        match &entry.space {
            Some(space) => {
                self.resolver
                    .check_access(Role::Reader, space, Some(user))
                    .await?;
                Ok(entry)
            }
            None => Err(StoreError::not_found(encoded_key)),
        }
    }

    async fn scan(
        &self,
        typ: HistoryType,
        selector: Option<&str>,
        user: &User,
        state: &ListState,
        needle: Option<&str>,
    ) -> StoreResult<(Vec<HistoryEntry>, Option<String>)> {
        // Space listings are gated once, up front; every other type only
        // ever surfaces the caller's own traces.
        let space_wide = match (typ, selector) {
            (HistoryType::Space, Some(space)) => {
                self.resolver
                    .check_access(Role::Reader, space, Some(user))
                    .await?;
                true
            }
            _ => false,
        };

        // The data keys are user-scoped already, so user listings scan the
        // bodies directly; every other type walks its pointer partition.
        let (sub, prefix) = match typ {
            HistoryType::User => (&self.data, "~history~".to_string()),
            HistoryType::Space => (&self.by_space, keys::history_index_prefix("space")),
            HistoryType::Project => (&self.by_project, keys::history_index_prefix("project")),
            HistoryType::Request => (&self.by_request, keys::history_index_prefix("request")),
            HistoryType::App => (&self.by_app, keys::history_index_prefix("app")),
        };
        let (gte, mut lte) = keys::prefix_range(&prefix);
        if let Some(last) = &state.last_key {
            if last.as_str() >= gte.as_str() && last.as_str() <= lte.as_str() {
                lte = last.clone();
            }
        }
        let mut iter = sub.iterate(
            IterateOptions {
                gte: Some(gte),
                lte: Some(lte),
                ..Default::default()
            }
            .reversed(),
        );

        let mut items = Vec::new();
        let mut last_key = None;
        while let Some(pointer) = iter.next().await {
            if state.last_key.as_deref() == Some(pointer.key.as_str()) {
                continue;
            }
            if items.len() >= state.limit {
                break;
            }
            let Some(bytes) = pointer.value else { continue };
            let entry: HistoryEntry = if typ == HistoryType::User {
                serde_json::from_slice(&bytes)?
            } else {
                let data_key: String = serde_json::from_slice(&bytes)?;
                let Some(entry_bytes) = self.data.get_many(&[data_key]).await.pop().flatten()
                else {
                    continue;
                };
                serde_json::from_slice(&entry_bytes)?
            };

            let scoped = match (typ, selector) {
                (HistoryType::User, _) => true,
                (HistoryType::Space, Some(space)) => entry.space.as_deref() == Some(space),
                (HistoryType::Project, Some(project)) => {
                    entry.project.as_deref() == Some(project)
                }
                (HistoryType::Request, Some(request)) => {
                    entry.request.as_deref() == Some(request)
                }
                (HistoryType::App, Some(app)) => entry.app.as_deref() == Some(app),
                _ => true,
            };
            if !scoped {
                continue;
            }
            if !space_wide && entry.user != user.key {
                continue;
            }
            if let Some(needle) = needle {
                if !matches_text(&entry, needle) {
                    continue;
                }
            }
            last_key = Some(pointer.key);
            items.push(entry);
        }
        Ok((items, last_key))
    }

}

fn matches_text(entry: &HistoryEntry, needle: &str) -> bool {
    let request = &entry.log.request;
    let response = &entry.log.response;
    let haystacks = [
        request.get("url"),
        request.get("headers"),
        request.get("httpMessage"),
        request.get("payload"),
        response.get("headers"),
        response.get("payload"),
    ];
    haystacks
        .into_iter()
        .flatten()
        .any(|value| value_contains(value, needle))
}

fn value_contains(value: &JsonValue, needle: &str) -> bool {
    match value {
        JsonValue::String(s) => s.to_lowercase().contains(needle),
        // Structured payloads carry their text under `data`.
        JsonValue::Object(map) => map
            .get("data")
            .and_then(JsonValue::as_str)
            .map(|s| s.to_lowercase().contains(needle))
            .unwrap_or(false),
        _ => false,
    }
}

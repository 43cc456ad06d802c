//! User records.
//!
//! Users are provisioned by the authentication collaborator; the store
//! only persists and queries them. The substring query is case-insensitive
//! over `name` and every attached email, and never returns the requesting
//! user.

use std::sync::Arc;

use crate::cursor::ListState;
use crate::error::StoreResult;
use crate::kv::{IterateOptions, SubStore};
use crate::types::User;

pub struct UserStore {
    sub: Arc<SubStore>,
}

impl UserStore {
    pub fn new(sub: Arc<SubStore>) -> Self {
        Self { sub }
    }

    /// Insert or replace a user record.
    pub async fn add(&self, user: &User) -> StoreResult<()> {
        self.sub.put_json(&user.key, user).await
    }

    /// Read one user.
    pub async fn read(&self, id: &str) -> StoreResult<User> {
        self.sub.get_json(id).await
    }

    /// Read many users, preserving input order; unknown ids yield `None`.
    pub async fn read_many(&self, ids: &[String]) -> StoreResult<Vec<Option<User>>> {
        self.sub.get_many_json(ids).await
    }

    /// Ids absent from the store. Used to validate access-patch adds.
    pub async fn list_missing(&self, ids: &[String]) -> StoreResult<Vec<String>> {
        let found = self.sub.get_many(ids).await;
        Ok(ids
            .iter()
            .zip(found)
            .filter(|(_, slot)| slot.is_none())
            .map(|(id, _)| id.clone())
            .collect())
    }

    /// Page through users, optionally filtered by a substring query.
    pub async fn list(
        &self,
        state: &ListState,
        requesting: Option<&User>,
    ) -> StoreResult<(Vec<User>, Option<String>)> {
        let gte = state.last_key.clone();
        let mut iter = self.sub.iterate(IterateOptions {
            gte,
            ..Default::default()
        });
        let query = state.query.as_deref().map(str::to_lowercase);
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
            let user: User = serde_json::from_slice(&bytes)?;
            if let Some(requesting) = requesting {
                if user.key == requesting.key {
                    continue;
                }
            }
            if let Some(query) = &query {
                if !Self::matches(&user, query) {
                    continue;
                }
            }
            last_key = Some(entry.key);
            items.push(user);
        }
        Ok((items, last_key))
    }

    fn matches(user: &User, query: &str) -> bool {
        if user.name.to_lowercase().contains(query) {
            return true;
        }
        user.email
            .iter()
            .any(|e| e.email.to_lowercase().contains(query))
    }
}

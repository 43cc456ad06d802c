//! Reverse index from users to the files shared with them.
//!
//! Listing a user's files would otherwise require scanning every file's
//! permission records; this index makes the membership test a point
//! lookup. Entries are maintained by access patches and removed when the
//! file is deleted.

use std::sync::Arc;

use crate::error::StoreResult;
use crate::keys;
use crate::kv::{IterateOptions, SubStore};
use crate::types::SharedLink;

pub struct SharedIndex {
    sub: Arc<SubStore>,
}

impl SharedIndex {
    pub fn new(sub: Arc<SubStore>) -> Self {
        Self { sub }
    }

    /// Record that `file` is shared with `uid`.
    ///
    /// `parent` is the immediate parent id when the share was granted at a
    /// child of the shared resource.
    pub async fn add(&self, uid: &str, file: &str, parent: Option<String>) -> StoreResult<()> {
        let link = SharedLink {
            id: file.to_string(),
            uid: uid.to_string(),
            parent,
        };
        self.sub.put_json(&keys::shared(uid, file)?, &link).await
    }

    /// Remove one share entry. Idempotent.
    pub async fn remove(&self, uid: &str, file: &str) -> StoreResult<()> {
        self.sub.del(&keys::shared(uid, file)?).await
    }

    /// Whether `file` is shared with `uid`.
    pub async fn has(&self, uid: &str, file: &str) -> bool {
        match keys::shared(uid, file) {
            Ok(key) => self.sub.has(&key).await,
            Err(_) => false,
        }
    }

    /// Every link of one user.
    pub async fn list_for_user(&self, uid: &str) -> StoreResult<Vec<SharedLink>> {
        let prefix = keys::shared_prefix(uid)?;
        let mut iter = self.sub.iterate(IterateOptions::prefix(&prefix));
        let mut links = Vec::new();
        while let Some(entry) = iter.next().await {
            if let Some(bytes) = entry.value {
                links.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(links)
    }

    /// Remove every link pointing at `file`, across all users.
    ///
    /// Runs on resource deletion. The scan walks the whole partition; the
    /// key shape indexes by user, not by file.
    pub async fn remove_all_for_file(&self, file: &str) -> StoreResult<()> {
        let mut iter = self.sub.iterate(IterateOptions::default().keys());
        let suffix = format!("~{file}");
        let mut doomed = Vec::new();
        while let Some(entry) = iter.next().await {
            if entry.key.ends_with(&suffix) {
                doomed.push(entry.key);
            }
        }
        for key in doomed {
            self.sub.del(&key).await?;
        }
        Ok(())
    }
}

//! The bin: an append-only record of deletions.
//!
//! Keyed by `~deleted~<kind>~<originalKey>`, so `is_deleted` is a single
//! point lookup; access checks use it to short-circuit bin-deleted
//! resources to `NotFound`. Entries stay until an external cleaner runs.

use std::sync::Arc;

use crate::error::StoreResult;
use crate::keys;
use crate::kv::SubStore;
use crate::types::{now_millis, BinItem, User};

/// Append-only map of soft-deleted items.
pub struct Bin {
    sub: Arc<SubStore>,
}

impl Bin {
    pub fn new(sub: Arc<SubStore>) -> Self {
        Self { sub }
    }

    /// Record a deletion.
    pub async fn add(&self, kind: &str, key: &str, user: Option<&User>) -> StoreResult<BinItem> {
        let bin_key = keys::bin(kind, key)?;
        let item = BinItem {
            key: key.to_string(),
            deleted_time: now_millis(),
            deleted_by: user.map(|u| u.key.clone()),
        };
        self.sub.put_json(&bin_key, &item).await?;
        Ok(item)
    }

    /// Read a deletion record.
    pub async fn read(&self, kind: &str, key: &str) -> StoreResult<BinItem> {
        self.sub.get_json(&keys::bin(kind, key)?).await
    }

    /// O(1) check used during access decisions.
    pub async fn is_deleted(&self, kind: &str, key: &str) -> bool {
        match keys::bin(kind, key) {
            Ok(bin_key) => self.sub.has(&bin_key).await,
            Err(_) => false,
        }
    }

    /// Drop a deletion record after an undelete. Idempotent.
    pub async fn remove(&self, kind: &str, key: &str) -> StoreResult<()> {
        self.sub.del(&keys::bin(kind, key)?).await
    }
}

//! Append-only patch history per (kind, key).
//!
//! Revision keys embed the creation millis, zero-padded, so a reverse
//! prefix scan yields newest first. Revisions are immutable once written
//! and survive deletion of the record they describe.

use json_patch::Patch;
use std::sync::Arc;

use crate::cursor::ListState;
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::kv::{IterateOptions, SubStore};
use crate::types::{now_millis, Alt, Revision};

pub struct RevisionStore {
    sub: Arc<SubStore>,
}

impl RevisionStore {
    pub fn new(sub: Arc<SubStore>) -> Self {
        Self { sub }
    }

    /// Append a revision for one successful content patch.
    pub async fn add(
        &self,
        kind: &str,
        key: &str,
        patch: &Patch,
        revert: &Patch,
    ) -> StoreResult<Revision> {
        let mut created = now_millis();
        let mut id = keys::revision(kind, key, created)?;
        // Two patches inside the same millisecond would collide; bump until
        // the slot is free so the append stays strictly ordered.
        while self.sub.has(&id).await {
            created += 1;
            id = keys::revision(kind, key, created)?;
        }
        let revision = Revision {
            id: id.clone(),
            key: key.to_string(),
            kind: kind.to_string(),
            created,
            deleted: false,
            patch: patch.clone(),
            revert: revert.clone(),
        };
        self.sub.put_json(&id, &revision).await?;
        Ok(revision)
    }

    /// List revisions of one (kind, parent), newest first.
    ///
    /// Only the media representation has revisions today; asking for the
    /// meta one is `InvalidInput`.
    pub async fn list(
        &self,
        kind: &str,
        parent: &str,
        alt: Alt,
        state: &ListState,
    ) -> StoreResult<(Vec<Revision>, Option<String>)> {
        if alt != Alt::Media {
            return Err(StoreError::invalid("unsupported alt"));
        }
        let prefix = keys::revision_prefix(kind, parent)?;
        let (gte, mut lte) = keys::prefix_range(&prefix);
        // Resuming a reverse scan: bound the range at the last-seen key and
        // drop the boundary entry itself below.
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
            if let Some(bytes) = entry.value {
                let revision: Revision = serde_json::from_slice(&bytes)?;
                last_key = Some(entry.key);
                items.push(revision);
            }
        }
        Ok((items, last_key))
    }
}

//! Opaque session blobs.
//!
//! The token layer owns the session contents; the store treats them as
//! bytes. Blobs are base64-wrapped so the stored value stays UTF-8 JSON
//! like every other partition.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::kv::SubStore;

#[derive(Serialize, Deserialize)]
struct SessionBlob {
    data: String,
}

pub struct SessionStore {
    sub: Arc<SubStore>,
}

impl SessionStore {
    pub fn new(sub: Arc<SubStore>) -> Self {
        Self { sub }
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let blob = SessionBlob {
            data: STANDARD.encode(value),
        };
        self.sub.put_json(key, &blob).await
    }

    pub async fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        let blob: SessionBlob = self.sub.get_json(key).await?;
        STANDARD
            .decode(blob.data)
            .map_err(|_| StoreError::Internal(format!("corrupt session blob: {key}")))
    }

    /// Idempotent.
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.sub.del(key).await
    }
}

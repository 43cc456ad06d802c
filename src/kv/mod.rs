//! The ordered key-value engine and its logical sub-stores.
//!
//! One [`OrderedStore`] owns a set of named [`SubStore`] partitions. Each
//! partition is an independent byte-ordered keyspace; values are UTF-8
//! JSON. Writes are serialized per key by the underlying map; nothing here
//! provides cross-key transactions.
//!
//! Iteration snapshots the matching key range up front and fetches values
//! lazily, so dropping an [`Iter`] mid-scan releases everything it holds —
//! that is the cancellation story for long listings. Keys deleted between
//! snapshot and fetch are skipped, never surfaced as errors.

mod wal;

pub use wal::{Wal, WalOp, WalRecord};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// One operation inside a [`SubStore::batch`] call.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

/// Options for [`SubStore::iterate`].
#[derive(Debug, Clone, Default)]
pub struct IterateOptions {
    /// Inclusive lower bound.
    pub gte: Option<String>,
    /// Inclusive upper bound.
    pub lte: Option<String>,
    /// Newest-last families use this to get newest-first scans.
    pub reverse: bool,
    /// Skip value fetches; entries carry only keys.
    pub keys_only: bool,
}

impl IterateOptions {
    /// Iterate every key under `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        let (gte, lte) = crate::keys::prefix_range(prefix);
        Self {
            gte: Some(gte),
            lte: Some(lte),
            ..Self::default()
        }
    }

    /// Reverse the scan direction.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Fetch keys only.
    pub fn keys(mut self) -> Self {
        self.keys_only = true;
        self
    }
}

/// One entry yielded by an [`Iter`].
#[derive(Debug, Clone)]
pub struct IterEntry {
    pub key: String,
    /// Absent in keys-only mode.
    pub value: Option<Vec<u8>>,
}

/// A lazily-fetching scan over a snapshot of matching keys.
pub struct Iter {
    sub: Arc<SubStore>,
    keys: VecDeque<String>,
    keys_only: bool,
}

impl Iter {
    /// The next entry, or `None` at the end of the range.
    ///
    /// Keys deleted since the snapshot are skipped.
    pub async fn next(&mut self) -> Option<IterEntry> {
        while let Some(key) = self.keys.pop_front() {
            if self.keys_only {
                return Some(IterEntry { key, value: None });
            }
            match self.sub.get(&key).await {
                Ok(value) => {
                    return Some(IterEntry {
                        key,
                        value: Some(value),
                    })
                }
                Err(_) => continue,
            }
        }
        None
    }

    /// Keys left in the snapshot.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

/// An ordered partition of the store.
pub struct SubStore {
    name: String,
    map: RwLock<BTreeMap<String, Vec<u8>>>,
    wal: Option<Arc<Wal>>,
}

impl SubStore {
    fn new(name: &str, wal: Option<Arc<Wal>>) -> Self {
        Self {
            name: name.to_string(),
            map: RwLock::new(BTreeMap::new()),
            wal,
        }
    }

    /// The partition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one value. Missing keys surface [`StoreError::NotFound`].
    pub async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let map = self.map.read().expect("sub-store lock");
        map.get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(key))
    }

    /// Read many values, preserving input order; missing slots are `None`.
    pub async fn get_many(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let map = self.map.read().expect("sub-store lock");
        keys.iter().map(|key| map.get(key).cloned()).collect()
    }

    /// Whether a key exists.
    pub async fn has(&self, key: &str) -> bool {
        self.map.read().expect("sub-store lock").contains_key(key)
    }

    /// Write one value.
    pub async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if let Some(wal) = &self.wal {
            wal.append_put(&self.name, key, value).await?;
        }
        self.map
            .write()
            .expect("sub-store lock")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Delete one key. Idempotent.
    pub async fn del(&self, key: &str) -> StoreResult<()> {
        if let Some(wal) = &self.wal {
            wal.append_del(&self.name, key).await?;
        }
        self.map.write().expect("sub-store lock").remove(key);
        Ok(())
    }

    /// Apply a sequence of operations.
    ///
    /// Operations are applied in order; a WAL failure part-way is returned
    /// and the already-applied prefix stands, recoverable by idempotent
    /// retry.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        for op in ops {
            match op {
                BatchOp::Put { key, value } => self.put(&key, &value).await?,
                BatchOp::Del { key } => self.del(&key).await?,
            }
        }
        Ok(())
    }

    /// Deserialize one stored record.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<T> {
        let bytes = self.get(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Deserialize many stored records, preserving input order.
    pub async fn get_many_json<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> StoreResult<Vec<Option<T>>> {
        let raw = self.get_many(keys).await;
        raw.into_iter()
            .map(|slot| slot.map(|bytes| serde_json::from_slice(&bytes)).transpose())
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)
    }

    /// Serialize and write one record.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes).await
    }

    /// Scan a key range. See the module docs for snapshot semantics.
    pub fn iterate(self: &Arc<Self>, options: IterateOptions) -> Iter {
        let map = self.map.read().expect("sub-store lock");
        let lower = match &options.gte {
            Some(key) => Bound::Included(key.clone()),
            None => Bound::Unbounded,
        };
        let upper = match &options.lte {
            Some(key) => Bound::Included(key.clone()),
            None => Bound::Unbounded,
        };
        let mut keys: VecDeque<String> = map.range((lower, upper)).map(|(k, _)| k.clone()).collect();
        drop(map);
        if options.reverse {
            keys.make_contiguous().reverse();
        }
        Iter {
            sub: Arc::clone(self),
            keys,
            keys_only: options.keys_only,
        }
    }

    /// Number of stored keys.
    pub async fn count(&self) -> usize {
        self.map.read().expect("sub-store lock").len()
    }

    /// Apply a replayed WAL record without re-logging it.
    fn apply_replayed(&self, record: &WalRecord) {
        let mut map = self.map.write().expect("sub-store lock");
        match record.op {
            WalOp::Put => {
                if let Some(value) = &record.value {
                    map.insert(record.key.clone(), value.clone());
                }
            }
            WalOp::Del => {
                map.remove(&record.key);
            }
        }
    }
}

/// The ordered KV engine: named partitions over one optional WAL.
pub struct OrderedStore {
    partitions: DashMap<String, Arc<SubStore>>,
    wal: Option<Arc<Wal>>,
}

impl OrderedStore {
    /// Open the engine, replaying the WAL when a data dir is configured.
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        let wal = match &config.data_dir {
            Some(dir) => Some(Arc::new(Wal::open(dir).await?)),
            None => None,
        };
        let store = Self {
            partitions: DashMap::new(),
            wal,
        };
        if let Some(dir) = &config.data_dir {
            let records = Wal::replay(dir).await?;
            let replayed = records.len();
            for record in records {
                store.partition(&record.store).apply_replayed(&record);
            }
            if replayed > 0 {
                tracing::info!(records = replayed, "replayed write-ahead log");
            }
        }
        Ok(store)
    }

    /// Get or create a named partition.
    pub fn partition(&self, name: &str) -> Arc<SubStore> {
        self.partitions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(SubStore::new(name, self.wal.clone())))
            .clone()
    }

    /// Names of every live partition.
    pub fn partition_names(&self) -> Vec<String> {
        self.partitions.iter().map(|e| e.key().clone()).collect()
    }

    /// Flush the WAL, if any.
    pub async fn flush(&self) -> StoreResult<()> {
        if let Some(wal) = &self.wal {
            wal.flush().await?;
        }
        Ok(())
    }
}

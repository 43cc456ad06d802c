//! Write-ahead log for the ordered store.
//!
//! Every mutation appends one newline-delimited JSON entry to the active
//! segment; on open the segments are replayed in order to rebuild the
//! in-memory partitions. Entries carry a CRC32 checksum; entries that fail
//! verification are skipped with a warning so a torn tail write cannot
//! prevent the store from opening.
//!
//! # Storage layout
//!
//! ```text
//! <data_dir>/
//! ├── wal/
//! │   ├── 000001.wal      # log segments, append-only
//! │   ├── 000002.wal
//! │   └── metadata.json   # last_seq + current segment
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};

/// Current WAL format version.
const WAL_VERSION: u32 = 1;

/// Maximum segment size before rotation (10MB).
const MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    /// WAL format version.
    version: u32,
    /// Operation type: "put" or "del".
    op: String,
    /// Sub-store the operation targets.
    store: String,
    /// Key within the sub-store.
    key: String,
    /// The stored JSON value ("put" only).
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<JsonValue>,
    /// Timestamp of the write.
    timestamp: DateTime<Utc>,
    /// Monotonic sequence number.
    seq: u64,
    /// Checksum of the entry. Format: "crc32:XXXXXXXX".
    checksum: String,
}

/// A verified, replayable operation read back from the log.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub op: WalOp,
    pub store: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Operation kind of a [`WalRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Put,
    Del,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalMetadata {
    last_seq: u64,
    current_segment: u32,
}

impl Default for WalMetadata {
    fn default() -> Self {
        Self {
            last_seq: 0,
            current_segment: 1,
        }
    }
}

/// Calculate CRC32 checksum for data integrity.
fn calculate_checksum(data: &str) -> String {
    let crc = crc32fast::hash(data.as_bytes());
    format!("crc32:{crc:08x}")
}

/// Serialize the checksummed portion of an entry.
fn checksum_body(entry: &LogEntry) -> String {
    serde_json::json!({
        "version": entry.version,
        "op": &entry.op,
        "store": &entry.store,
        "key": &entry.key,
        "value": &entry.value,
        "timestamp": entry.timestamp,
        "seq": entry.seq,
    })
    .to_string()
}

fn verify_checksum(entry: &LogEntry) -> bool {
    entry.checksum == calculate_checksum(&checksum_body(entry))
}

fn segment_path(wal_dir: &Path, segment: u32) -> PathBuf {
    wal_dir.join(format!("{segment:06}.wal"))
}

struct WalState {
    metadata: WalMetadata,
    file: fs::File,
    file_len: u64,
}

/// Append-only persistence log shared by every sub-store.
pub struct Wal {
    dir: PathBuf,
    state: Mutex<WalState>,
}

impl Wal {
    /// Open (or create) the log under `data_dir`.
    pub async fn open(data_dir: &Path) -> StoreResult<Self> {
        let dir = data_dir.join("wal");
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Internal(format!("failed to create WAL dir: {e}")))?;

        let metadata = load_metadata(&dir).await.unwrap_or_default();
        let path = segment_path(&dir, metadata.current_segment);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::Internal(format!("failed to open WAL segment: {e}")))?;
        let file_len = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            dir,
            state: Mutex::new(WalState {
                metadata,
                file,
                file_len,
            }),
        })
    }

    /// Append a put to the log.
    pub async fn append_put(&self, store: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        let value: JsonValue = serde_json::from_slice(value)?;
        self.append("put", store, key, Some(value)).await
    }

    /// Append a delete to the log.
    pub async fn append_del(&self, store: &str, key: &str) -> StoreResult<()> {
        self.append("del", store, key, None).await
    }

    async fn append(
        &self,
        op: &str,
        store: &str,
        key: &str,
        value: Option<JsonValue>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.metadata.last_seq += 1;

        let mut entry = LogEntry {
            version: WAL_VERSION,
            op: op.to_string(),
            store: store.to_string(),
            key: key.to_string(),
            value,
            timestamp: Utc::now(),
            seq: state.metadata.last_seq,
            checksum: String::new(),
        };
        entry.checksum = calculate_checksum(&checksum_body(&entry));

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if state.file_len + line.len() as u64 > MAX_SEGMENT_SIZE {
            self.rotate(&mut state).await?;
        }

        state
            .file
            .write_all(&line)
            .await
            .map_err(|e| StoreError::Internal(format!("WAL write failed: {e}")))?;
        state.file_len += line.len() as u64;

        save_metadata(&self.dir, &state.metadata).await?;
        Ok(())
    }

    async fn rotate(&self, state: &mut WalState) -> StoreResult<()> {
        state.metadata.current_segment += 1;
        let path = segment_path(&self.dir, state.metadata.current_segment);
        state.file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::Internal(format!("WAL rotation failed: {e}")))?;
        state.file_len = 0;
        tracing::debug!(segment = state.metadata.current_segment, "rotated WAL segment");
        Ok(())
    }

    /// Flush buffered writes to disk.
    pub async fn flush(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        state
            .file
            .sync_all()
            .await
            .map_err(|e| StoreError::Internal(format!("WAL sync failed: {e}")))
    }

    /// Replay every verified entry in sequence order.
    ///
    /// Entries failing checksum verification are skipped with a warning;
    /// a torn tail write therefore costs at most the torn entries.
    pub async fn replay(data_dir: &Path) -> StoreResult<Vec<WalRecord>> {
        let dir = data_dir.join("wal");
        let metadata = match load_metadata(&dir).await {
            Some(metadata) => metadata,
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::new();
        for segment in 1..=metadata.current_segment {
            let path = segment_path(&dir, segment);
            let file = match fs::File::open(&path).await {
                Ok(file) => file,
                Err(_) => continue,
            };
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| StoreError::Internal(format!("WAL read failed: {e}")))?
            {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = match serde_json::from_str(&line) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(segment, %err, "skipping unparseable WAL entry");
                        continue;
                    }
                };
                if !verify_checksum(&entry) {
                    tracing::warn!(segment, seq = entry.seq, "skipping corrupt WAL entry");
                    continue;
                }
                let op = match entry.op.as_str() {
                    "put" => WalOp::Put,
                    "del" => WalOp::Del,
                    other => {
                        tracing::warn!(segment, op = other, "skipping unknown WAL op");
                        continue;
                    }
                };
                let value = match entry.value {
                    Some(value) => Some(serde_json::to_vec(&value)?),
                    None => None,
                };
                records.push(WalRecord {
                    op,
                    store: entry.store,
                    key: entry.key,
                    value,
                });
            }
        }
        Ok(records)
    }
}

async fn load_metadata(wal_dir: &Path) -> Option<WalMetadata> {
    let bytes = fs::read(wal_dir.join("metadata.json")).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn save_metadata(wal_dir: &Path, metadata: &WalMetadata) -> StoreResult<()> {
    let bytes = serde_json::to_vec(metadata)?;
    fs::write(wal_dir.join("metadata.json"), bytes)
        .await
        .map_err(|e| StoreError::Internal(format!("WAL metadata write failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).await.unwrap();

        wal.append_put("files", "f1", br#"{"name":"one"}"#)
            .await
            .unwrap();
        wal.append_put("files", "f2", br#"{"name":"two"}"#)
            .await
            .unwrap();
        wal.append_del("files", "f1").await.unwrap();
        wal.flush().await.unwrap();
        drop(wal);

        let records = Wal::replay(dir.path()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, WalOp::Put);
        assert_eq!(records[0].key, "f1");
        assert_eq!(records[2].op, WalOp::Del);
        assert_eq!(records[2].key, "f1");
    }

    #[tokio::test]
    async fn test_replay_skips_corrupt_tail() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).await.unwrap();
        wal.append_put("files", "f1", br#"{"name":"one"}"#)
            .await
            .unwrap();
        wal.flush().await.unwrap();
        drop(wal);

        // Simulate a torn write at the tail of the segment.
        let segment = dir.path().join("wal").join("000001.wal");
        let mut contents = std::fs::read(&segment).unwrap();
        contents.extend_from_slice(b"{\"version\":1,\"op\":\"put\",\"sto");
        std::fs::write(&segment, contents).unwrap();

        let records = Wal::replay(dir.path()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "f1");
    }

    #[tokio::test]
    async fn test_replay_skips_tampered_entry() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).await.unwrap();
        wal.append_put("files", "f1", br#"{"secret":false}"#)
            .await
            .unwrap();
        wal.flush().await.unwrap();
        drop(wal);

        let segment = dir.path().join("wal").join("000001.wal");
        let contents = std::fs::read_to_string(&segment).unwrap();
        let tampered = contents.replace("false", " true");
        std::fs::write(&segment, tampered).unwrap();

        let records = Wal::replay(dir.path()).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_empty_dir_replays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let records = Wal::replay(dir.path()).await.unwrap();
        assert!(records.is_empty());
    }
}

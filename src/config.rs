//! Store configuration.
//!
//! A plain struct the embedding process fills in. There is no file or
//! environment loading here; that belongs to the bootstrap layer.

use std::path::PathBuf;

/// Configuration for a [`StoreHub`](crate::hub::StoreHub).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory for the on-disk layout. `None` keeps everything in memory,
    /// which is what the test suites use.
    pub data_dir: Option<PathBuf>,

    /// Single-user mode: access checks resolve to `owner` without
    /// consulting the permission store, and absent users default to the
    /// `default` identity.
    pub single_user: bool,

    /// Key used to sign pagination cursors. A fresh random key is drawn
    /// when absent, which invalidates outstanding cursors across restarts.
    pub cursor_key: Option<[u8; 32]>,

    /// Per-channel buffer size for notification sinks.
    pub channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            single_user: false,
            cursor_key: None,
            channel_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// In-memory configuration, multi-user.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persistent configuration rooted at `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Switch on single-user mode.
    pub fn single_user(mut self) -> Self {
        self.single_user = true;
        self
    }

    /// Pin the cursor-signing key.
    pub fn with_cursor_key(mut self, key: [u8; 32]) -> Self {
        self.cursor_key = Some(key);
        self
    }
}

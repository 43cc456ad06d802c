//! # collab-store
//!
//! The persistence and real-time notification core of a multi-tenant
//! API-design collaboration backend. It stores workspaces, nested
//! sub-spaces, files and their contents, per-application projects and
//! requests, revision history, users, sessions, and permissions; enforces
//! hierarchical access control; records deletions into a recoverable bin;
//! and fans out change notifications to connected clients filtered by
//! URL, user, and session.
//!
//! ## Quick start
//!
//! ```ignore
//! use collab_store::{StoreConfig, StoreHub};
//! use collab_store::types::{FileMeta, User, KIND_WORKSPACE};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = StoreHub::start(StoreConfig::at("/var/lib/collab")).await?;
//!
//!     let user = User::new("u1", "Alice");
//!     hub.user_add(&user).await?;
//!
//!     let space = FileMeta::new("s1", KIND_WORKSPACE, "My workspace");
//!     hub.file_create(space, Some(&user), None).await?;
//!
//!     let read = hub.file_read("s1", Some(&user)).await?;
//!     println!("owner: {}", read.owner);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Everything hangs off three layers:
//!
//! 1. **[`StoreHub`]** (`hub`) — one method per API operation; owns the
//!    access check, the writes, and the event fan-out for each.
//! 2. **Domain stores** (`files`, `media`, `app`, `history`, …) — each
//!    wraps one or more sub-store partitions with its family's semantics.
//! 3. **[`OrderedStore`](kv::OrderedStore)** (`kv`) — the byte-ordered
//!    key-value engine with named partitions and an optional write-ahead
//!    log.
//!
//! The HTTP router, token issuance, and the request-executing proxy are
//! external collaborators: they call hub methods and translate
//! [`StoreError`] values into wire envelopes via
//! [`StoreError::envelope`].
//!
//! ## Thread safety
//!
//! A [`StoreHub`] is shared behind an `Arc` across request handlers.
//! Writes to one key are serialized by a per-key advisory lock; readers
//! never block writers. Notifications for an operation are published only
//! after its writes complete.

pub mod access;
pub mod app;
pub mod bus;
pub mod config;
pub mod cursor;
mod error;
pub mod files;
pub mod history;
pub mod hub;
pub mod keys;
pub mod kv;
pub mod media;
pub mod patch;
pub mod permissions;
pub mod projects;
pub mod revisions;
pub mod search;
pub mod sessions;
pub mod shared;
pub mod spaces;
pub mod trash;
pub mod types;
pub mod users;

// Public API exports
pub use config::StoreConfig;
pub use cursor::{ListOptions, ListState};
pub use error::{StoreError, StoreResult};
pub use hub::{ListPage, StoreHub, StoreStats};

// Bus exports
pub use bus::{ChannelFilter, Event, EventSink, NotificationBus, Operation, QueueSink};

// Access-control exports
pub use files::{AccessOp, AccessOperation};
pub use types::{Alt, FileMeta, Media, Permission, PermissionType, Revision, Role, User};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{json, Value as JsonValue};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use collab_store::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::StoreConfig;
    pub use crate::cursor::ListOptions;
    pub use crate::error::{StoreError, StoreResult};
    pub use crate::hub::{ListPage, StoreHub};
    pub use crate::types::{Alt, FileMeta, Role, User};
    pub use serde_json::{json, Value as JsonValue};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// Call once at application startup. The log level is controlled through
/// the `COLLAB_STORE_LOG` environment variable (`error`, `warn`, `info`,
/// `debug`, `trace`); the default is `info`.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("COLLAB_STORE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

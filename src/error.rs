//! Error types for store operations.
//!
//! Every fallible operation in the crate returns `Result<T, StoreError>`.
//! The variants map one-to-one onto the wire error kinds; `status()` gives
//! the deterministic HTTP status for each and `envelope()` the JSON body
//! the transport layer sends.

use serde_json::{json, Value as JsonValue};
use thiserror::Error;

/// The main error type for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No credentials were presented.
    #[error("Authentication required")]
    Unauthenticated,

    /// The caller holds a role below the minimum required one.
    #[error("Insufficient permissions for {key}")]
    Forbidden {
        /// The resource the caller was denied on
        key: String,
    },

    /// Missing, bin-deleted, or access-masked-as-missing.
    #[error("Not found: {key}")]
    NotFound {
        /// The key that was not found
        key: String,
    },

    /// Schema violation, missing required field, past expiration,
    /// unsupported `alt`, or an unknown user in an access operation.
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Description of what is invalid
        reason: String,
    },

    /// Malformed patch body or a patch touching a guarded path.
    #[error("Invalid patch: {reason}")]
    InvalidPatch {
        /// Description of why the patch was rejected
        reason: String,
    },

    /// Re-creation of a keyed resource, or an immutable media record
    /// when overwrite is disabled.
    #[error("Already exists: {key}")]
    AlreadyExists {
        /// The conflicting key
        key: String,
    },

    /// Placeholder kind, currently unused.
    #[error("Conflict")]
    Conflict,

    /// Storage engine failure. The only kind that is logged.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The caller went away before the operation completed.
    #[error("Cancelled")]
    Cancelled,
}

impl StoreError {
    /// Convenience constructor for [`StoreError::NotFound`].
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Convenience constructor for [`StoreError::InvalidInput`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`StoreError::InvalidPatch`].
    pub fn invalid_patch(reason: impl Into<String>) -> Self {
        Self::InvalidPatch {
            reason: reason.into(),
        }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::InvalidInput { .. } => 400,
            Self::InvalidPatch { .. } => 400,
            Self::AlreadyExists { .. } => 409,
            Self::Conflict => 409,
            Self::Internal(_) => 500,
            Self::Cancelled => 499,
        }
    }

    /// The structured error body the transport layer serializes.
    ///
    /// Shape: `{error: true, code, message, detail?}`.
    pub fn envelope(&self) -> JsonValue {
        let detail = match self {
            Self::Forbidden { key } | Self::NotFound { key } | Self::AlreadyExists { key } => {
                Some(json!({ "key": key }))
            }
            _ => None,
        };
        let mut body = json!({
            "error": true,
            "code": self.status(),
            "message": self.to_string(),
        });
        if let Some(detail) = detail {
            body["detail"] = detail;
        }
        body
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        // A stored value that no longer deserializes is engine-level corruption.
        Self::Internal(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io: {err}"))
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

//! Opaque pagination cursors.
//!
//! A cursor is a base64url JSON payload carrying the last-seen key and the
//! original listing parameters, signed with HMAC-SHA256 so clients cannot
//! tamper with limits or filters. Token form: `<payload>.<signature>`.
//!
//! Listing endpoints call [`CursorCodec::read_list_state`] to seed their
//! state from either a presented cursor or the raw options, and
//! [`CursorCodec::encode_cursor`] to mint the next token. When a page ends
//! with no further key the minted token equals its input, which is the
//! stable end-of-pagination signal clients key off.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{StoreError, StoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: usize = 1;
/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 100;
/// Page size used when the caller does not supply one.
pub const DEFAULT_PAGE_SIZE: usize = 35;

/// Parameters accepted by listing endpoints.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Cursor from a previous page; overrides every other field.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub query: Option<String>,
    pub query_field: Vec<String>,
    pub parent: Option<String>,
    pub since: Option<i64>,
}

impl ListOptions {
    /// Options carrying only a cursor.
    pub fn cursor(token: impl Into<String>) -> Self {
        Self {
            cursor: Some(token.into()),
            ..Self::default()
        }
    }

    /// Options carrying only a limit.
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// The state a listing resumes from; the cursor payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_key: Option<String>,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_field: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

/// Encodes, signs, and verifies cursors.
pub struct CursorCodec {
    key: [u8; 32],
}

impl CursorCodec {
    /// Create a codec with the given signing key, or a random one.
    ///
    /// A random key invalidates outstanding cursors across restarts, which
    /// clients handle by restarting pagination.
    pub fn new(key: Option<[u8; 32]>) -> Self {
        Self {
            key: key.unwrap_or_else(rand::random),
        }
    }

    /// Seed listing state from a cursor if one is presented, else from the
    /// raw options. The limit is clamped to `[1, 100]`, default `35`.
    pub fn read_list_state(&self, options: &ListOptions) -> StoreResult<ListState> {
        if let Some(token) = &options.cursor {
            return self.decode(token);
        }
        let limit = options
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        Ok(ListState {
            last_key: None,
            limit,
            query: options.query.clone(),
            query_field: options.query_field.clone(),
            parent: options.parent.clone(),
            since: options.since,
        })
    }

    /// Mint the cursor for the next page.
    ///
    /// With `last_key` absent the state is encoded unchanged, so an
    /// exhausted listing keeps returning the same token.
    pub fn encode_cursor(&self, state: &ListState, last_key: Option<&str>) -> String {
        let mut next = state.clone();
        if let Some(key) = last_key {
            next.last_key = Some(key.to_string());
        }
        self.encode(&next)
    }

    fn encode(&self, state: &ListState) -> String {
        // ListState serialization is deterministic (fixed field order), so
        // equal states produce equal tokens.
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(state).expect("list state serializes"));
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()));
        format!("{payload}.{signature}")
    }

    fn decode(&self, token: &str) -> StoreResult<ListState> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| StoreError::invalid("malformed cursor"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StoreError::invalid("malformed cursor"))?;
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| StoreError::invalid("cursor key"))?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| StoreError::invalid("cursor signature mismatch"))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| StoreError::invalid("malformed cursor"))?;
        let state: ListState =
            serde_json::from_slice(&bytes).map_err(|_| StoreError::invalid("malformed cursor"))?;
        if state.limit < MIN_PAGE_SIZE || state.limit > MAX_PAGE_SIZE {
            return Err(StoreError::invalid("cursor limit out of range"));
        }
        Ok(state)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("any key length works");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

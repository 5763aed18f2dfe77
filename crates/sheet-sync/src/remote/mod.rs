//! Remote record database: wire types, the `RemoteDatabase` trait and the
//! thin `RemoteClient` façade the sync engine talks to.
//!
//! Implementations of `RemoteDatabase`:
//! - `InMemoryRemote` - Simulated record database for tests and local multi-device runs
//! - `DirRemote` (in sheet-syncd) - `InMemoryRemote` persisted in a shared directory

mod client;
mod memory;

pub use client::{ChangeSink, RemoteClient};
pub use memory::{InMemoryRemote, RemoteOp, RemoteState, SaveHold};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A logical zone in the remote database, unique per (owner, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId {
    pub name: String,
    pub owner: String,
}

impl ZoneId {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Identity of a remote record: zone plus record name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub zone: ZoneId,
    pub name: String,
}

impl RecordId {
    pub fn new(zone: ZoneId, name: impl Into<String>) -> Self {
        Self {
            zone,
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone, self.name)
    }
}

/// Opaque continuation token of a zone's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A single field value on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    String(String),
    Int(i64),
    /// Unix milliseconds
    Timestamp(i64),
    Bytes(Vec<u8>),
}

/// Server-maintained system fields of a record.
///
/// Sent back with an update so the server can reject writes based on a
/// stale copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Changes on every server-side write
    pub change_tag: u64,
    /// Server modification time (Unix ms)
    pub modified_at: i64,
}

impl RecordMetadata {
    /// Encode into the opaque bytes kept on the local record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RemoteError::Unknown(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| RemoteError::Unknown(e.to_string()))
    }
}

/// Record as stored in (or sent to) the remote database.
///
/// For updates `fields` holds only the changed fields; the server merges them
/// into its copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RecordId,
    pub record_type: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// `None` for a record never seen by the server
    pub metadata: Option<RecordMetadata>,
}

impl RemoteRecord {
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            metadata: None,
        }
    }
}

/// One page of a zone's change feed.
#[derive(Debug, Clone)]
pub struct ChangesPage {
    pub changed: Vec<RemoteRecord>,
    pub deleted: Vec<RecordId>,
    /// Token to resume from after this page
    pub token: ChangeToken,
    pub more_coming: bool,
}

/// Closed set of errors reported by the remote database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Network failure")]
    NetworkFailure,

    #[error("Service unavailable (retry after {retry_after:?})")]
    ServiceUnavailable { retry_after: Option<Duration> },

    #[error("Request rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Zone busy (retry after {retry_after:?})")]
    ZoneBusy { retry_after: Option<Duration> },

    #[error("Internal server error")]
    InternalError,

    #[error("Server response lost")]
    ServerResponseLost,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Permission failure")]
    PermissionFailure,

    #[error("Zone not found")]
    ZoneNotFound,

    #[error("Zone deleted by user")]
    UserDeletedZone,

    #[error("Incompatible schema version")]
    IncompatibleVersion,

    #[error("Batch too large")]
    LimitExceeded,

    #[error("Change token expired")]
    ChangeTokenExpired,

    #[error("Partial failure: {} item(s) failed", .failures.len())]
    PartialFailure {
        failures: BTreeMap<RecordId, RemoteError>,
        /// Canonical copies of the records that were saved
        saved: Vec<RemoteRecord>,
    },

    #[error("Server record changed")]
    ServerRecordChanged,

    #[error("Unknown item")]
    UnknownItem,

    #[error("Batch request failed")]
    BatchRequestFailed,

    #[error("Remote error: {0}")]
    Unknown(String),
}

impl RemoteError {
    /// Retry delay suggested by the server, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ServiceUnavailable { retry_after }
            | Self::RateLimited { retry_after }
            | Self::ZoneBusy { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// The remote record database as the sync engine sees it.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// List existing zones
    async fn fetch_zones(&self) -> Result<Vec<ZoneId>>;

    /// Create a zone (no-op if it exists)
    async fn save_zone(&self, zone: &ZoneId) -> Result<()>;

    /// List subscription ids
    async fn fetch_subscriptions(&self) -> Result<Vec<String>>;

    /// Subscribe to change notifications for a zone
    async fn save_subscription(&self, id: &str, zone: &ZoneId) -> Result<()>;

    /// Fetch one page of changes since `since` (from the beginning if `None`)
    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        since: Option<&ChangeToken>,
        limit: usize,
    ) -> Result<ChangesPage>;

    /// Save records, rejecting any whose metadata is stale.
    ///
    /// Returns the server's canonical copy of every saved record.
    async fn save_records(&self, records: Vec<RemoteRecord>) -> Result<Vec<RemoteRecord>>;

    /// Current server copies of records. Missing records are left out.
    async fn fetch_records(&self, ids: Vec<RecordId>) -> Result<Vec<RemoteRecord>>;

    /// Delete records. Returns the ids that were deleted.
    async fn delete_records(&self, ids: Vec<RecordId>) -> Result<Vec<RecordId>>;
}

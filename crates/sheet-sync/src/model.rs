//! Local data model: sheets, deletion instructions and sync status.

use crate::fields::FieldMask;
use crate::remote::RecordId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Local identity of a stored object.
///
/// Assigned by the store on insert and stable across transactions, contexts
/// and restarts. Unrelated to the remote record name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches('#').parse().map(Self)
    }
}

/// Kind of values a column holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ColumnKind {
    Text,
    Number,
    Date,
    Checkbox,
    Choice { options: Vec<String> },
}

/// One column definition of a sheet. Columns are ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub title: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn text(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: ColumnKind::Text,
        }
    }
}

/// A sheet: the record type this engine keeps in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sheet {
    pub id: ObjectId,
    /// Natural key derived from the name at creation; never changes.
    pub key: String,
    pub name: String,
    pub notes: String,
    pub sort_order: i64,
    pub columns: Vec<ColumnSpec>,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Last local or remote modification (Unix ms)
    pub modified_at: i64,

    /// Remote record name, set once the sheet exists remotely
    pub remote_name: Option<String>,
    /// Last known remote system metadata (bincode-encoded `RecordMetadata`)
    pub remote_metadata: Option<Vec<u8>>,
    /// Fields with local edits not yet confirmed uploaded
    pub dirty: FieldMask,
}

impl Sheet {
    /// Build a sheet from a draft. The dirty mask starts empty; the store's
    /// tracker fills it when the creating transaction commits.
    pub fn from_draft(id: ObjectId, draft: NewSheet) -> Self {
        let now = now_millis();
        Self {
            id,
            key: natural_key(&draft.name),
            name: draft.name,
            notes: draft.notes,
            sort_order: draft.sort_order,
            columns: draft.columns,
            created_at: now,
            modified_at: now,
            remote_name: None,
            remote_metadata: None,
            dirty: FieldMask::empty(),
        }
    }

    /// Empty sheet used as the target when a remote record has no local
    /// counterpart yet.
    pub fn blank(id: ObjectId) -> Self {
        Self {
            id,
            key: String::new(),
            name: String::new(),
            notes: String::new(),
            sort_order: 0,
            columns: Vec::new(),
            created_at: 0,
            modified_at: 0,
            remote_name: None,
            remote_metadata: None,
            dirty: FieldMask::empty(),
        }
    }

    /// Whether the sheet was ever created remotely.
    pub fn is_uploaded(&self) -> bool {
        self.remote_name.is_some()
    }

    /// Record the remote identity and metadata returned by the server.
    pub fn set_remote_identity(&mut self, name: String, metadata: Vec<u8>) {
        self.remote_name = Some(name);
        self.remote_metadata = Some(metadata);
    }

    /// Forget the remote identity (the remote record vanished). Every field
    /// becomes dirty so the next insert recreates the full record.
    pub fn clear_remote_identity(&mut self) {
        self.remote_name = None;
        self.remote_metadata = None;
        self.dirty = FieldMask::all();
    }

    /// Bump the modification time. Call from interactive edits.
    pub fn touch(&mut self) {
        self.modified_at = now_millis().max(self.modified_at + 1);
    }
}

/// Values for a sheet about to be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSheet {
    pub name: String,
    pub notes: String,
    pub sort_order: i64,
    pub columns: Vec<ColumnSpec>,
}

impl NewSheet {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Remote deletion still owed for a locally deleted sheet.
///
/// Only the remote identity is kept: the local sheet is already gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingDeletion {
    pub record: RecordId,
}

/// Whether sync may run. A disable survives restarts until the user
/// re-enables sync explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    #[default]
    Enabled,
    Disabled { reason: String },
}

/// Normalize a sheet name into its natural key.
///
/// Trimmed, lower-cased, with whitespace runs collapsed to `-`.
pub fn natural_key(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_key_normalizes() {
        assert_eq!(natural_key("  Weekly   Groceries "), "weekly-groceries");
        assert_eq!(natural_key("Groceries"), natural_key("groceries"));
    }

    #[test]
    fn test_from_draft_starts_clean() {
        let sheet = Sheet::from_draft(ObjectId::new(1), NewSheet::named("Books Read"));
        assert_eq!(sheet.key, "books-read");
        assert!(sheet.dirty.is_empty());
        assert!(!sheet.is_uploaded());
        assert_eq!(sheet.created_at, sheet.modified_at);
    }

    #[test]
    fn test_clear_remote_identity_marks_everything_dirty() {
        let mut sheet = Sheet::from_draft(ObjectId::new(1), NewSheet::named("Books"));
        sheet.set_remote_identity("sheet-x".into(), vec![1, 2, 3]);
        assert!(sheet.is_uploaded());

        sheet.clear_remote_identity();
        assert!(sheet.remote_metadata.is_none());
        assert_eq!(sheet.dirty, FieldMask::all());
    }

    #[test]
    fn test_object_id_parse() {
        let id: ObjectId = "#42".parse().unwrap();
        assert_eq!(id, ObjectId::new(42));
        assert_eq!(id.to_string(), "#42");
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut sheet = Sheet::from_draft(ObjectId::new(1), NewSheet::named("A"));
        let before = sheet.modified_at;
        sheet.touch();
        assert!(sheet.modified_at > before);
    }
}

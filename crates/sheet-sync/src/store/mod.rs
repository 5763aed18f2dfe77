//! Transactional local store for sheets and sync bookkeeping.
//!
//! The whole state is one JSON document written through a `FileSystem`.
//! Transactions run against a working copy; a commit writes the new document
//! to a temporary file, renames it over the old one and only then swaps the
//! in-memory state. A failed write leaves both the file and memory untouched.
//!
//! Two roles share one store: `Interactive` (the app's foreground context) and
//! `Sync` (the background sync context). Only interactive commits feed the
//! dirty tracker; every commit publishes a `StoreEvent`.

mod tracker;

pub use tracker::changed_fields;

use crate::fs::{FileSystem, FsError, InMemoryFs};
use crate::mapper::{MapperError, RecordMapper};
use crate::model::{NewSheet, ObjectId, PendingDeletion, Sheet, SyncStatus};
use crate::remote::{ChangeToken, RecordId, ZoneId};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store file error: {0}")]
    Fs(#[from] FsError),

    #[error("Corrupt store document: {0}")]
    Corrupt(String),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MapperError),

    #[error("No sheet named {0:?}")]
    UnknownSheet(String),

    #[error("A sheet named {0:?} already exists")]
    DuplicateSheet(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Which context a transaction runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextRole {
    /// Foreground edits. The only context whose commits mark fields dirty.
    Interactive,
    /// Background sync context
    Sync,
}

/// Objects changed by one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub origin: ContextRole,
    pub inserted: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
}

impl StoreEvent {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Committed store document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct StoreState {
    next_object_id: u64,
    sheets: BTreeMap<ObjectId, Sheet>,
    pending_deletions: Vec<PendingDeletion>,
    change_tokens: Vec<(ZoneId, ChangeToken)>,
    sync_status: SyncStatus,
}

struct Inner {
    fs: Arc<dyn FileSystem>,
    path: String,
    mapper: RecordMapper,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

/// Shared handle to the local store.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    /// Open the store document at `path`, starting empty if it does not exist.
    ///
    /// `zone` is where deletion instructions for never-uploaded sheets point.
    pub async fn open(fs: Arc<dyn FileSystem>, path: impl Into<String>, zone: ZoneId) -> Result<Self> {
        let path = path.into();
        let state = if fs.exists(&path).await? {
            let bytes = fs.read(&path).await?;
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?
        } else {
            StoreState::default()
        };
        debug!(
            "Opened store {} with {} sheet(s)",
            path,
            state.sheets.len()
        );

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(Inner {
                fs,
                path,
                mapper: RecordMapper::new(zone),
                state: Mutex::new(state),
                events,
            }),
        })
    }

    /// Fresh store on an in-memory file system.
    pub async fn in_memory(zone: ZoneId) -> Result<Self> {
        Self::open(Arc::new(InMemoryFs::new()), "store.json", zone).await
    }

    /// Change events of every later commit.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Run `f` as one transaction in the given context.
    ///
    /// Returning `Err` from `f` discards every change it made.
    pub async fn transaction<T, E, F>(&self, role: ContextRole, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Transaction) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut committed = self.inner.state.lock().await;
        let mut tx = Transaction::begin(role, committed.clone());
        let value = f(&mut tx)?;

        let (next, event) = tx.finish(&self.inner.mapper, &committed);
        if next != *committed {
            self.persist(&next).await?;
            *committed = next;
        }
        if !event.is_empty() {
            debug!(
                "{:?} commit: {} inserted, {} updated, {} deleted",
                role,
                event.inserted.len(),
                event.updated.len(),
                event.deleted.len()
            );
            // No receivers is fine.
            let _ = self.inner.events.send(event);
        }
        Ok(value)
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(state).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = format!("{}.tmp", self.inner.path);
        if let Err(e) = self.inner.fs.write(&tmp, &bytes).await {
            warn!("Store commit failed: {}", e);
            return Err(e.into());
        }
        self.inner.fs.rename(&tmp, &self.inner.path).await?;
        Ok(())
    }

    // ==================== Reads ====================

    pub async fn sheet(&self, id: ObjectId) -> Option<Sheet> {
        self.inner.state.lock().await.sheets.get(&id).cloned()
    }

    /// Every sheet, ordered by sort position then name.
    pub async fn sheets(&self) -> Vec<Sheet> {
        let state = self.inner.state.lock().await;
        let mut sheets: Vec<Sheet> = state.sheets.values().cloned().collect();
        sheets.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.name.cmp(&b.name)));
        sheets
    }

    /// Up to `limit` sheets matching `predicate`, in object id order.
    pub async fn select(&self, predicate: impl Fn(&Sheet) -> bool, limit: usize) -> Vec<Sheet> {
        let state = self.inner.state.lock().await;
        state
            .sheets
            .values()
            .filter(|sheet| predicate(sheet))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn pending_deletions(&self, limit: usize) -> Vec<PendingDeletion> {
        let state = self.inner.state.lock().await;
        state.pending_deletions.iter().take(limit).cloned().collect()
    }

    pub async fn change_token(&self, zone: &ZoneId) -> Option<ChangeToken> {
        let state = self.inner.state.lock().await;
        find_token(&state, zone).cloned()
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.inner.state.lock().await.sync_status.clone()
    }
}

fn find_token<'a>(state: &'a StoreState, zone: &ZoneId) -> Option<&'a ChangeToken> {
    state
        .change_tokens
        .iter()
        .find(|(z, _)| z == zone)
        .map(|(_, token)| token)
}

/// Working copy of the store inside `LocalStore::transaction`.
pub struct Transaction {
    role: ContextRole,
    state: StoreState,
    inserted: BTreeSet<ObjectId>,
    touched: BTreeSet<ObjectId>,
    deleted: BTreeMap<ObjectId, Sheet>,
}

impl Transaction {
    fn begin(role: ContextRole, state: StoreState) -> Self {
        Self {
            role,
            state,
            inserted: BTreeSet::new(),
            touched: BTreeSet::new(),
            deleted: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    // ==================== Sheets ====================

    /// Insert a sheet built from its freshly assigned id.
    pub fn insert(&mut self, build: impl FnOnce(ObjectId) -> Sheet) -> ObjectId {
        self.state.next_object_id += 1;
        let id = ObjectId::new(self.state.next_object_id);
        self.state.sheets.insert(id, build(id));
        self.inserted.insert(id);
        id
    }

    /// Create a sheet from a draft. Names are unique by natural key.
    pub fn insert_sheet(&mut self, draft: NewSheet) -> Result<ObjectId> {
        let key = crate::model::natural_key(&draft.name);
        if self.find_by_key(&key).is_some() {
            return Err(StoreError::DuplicateSheet(draft.name));
        }
        Ok(self.insert(|id| Sheet::from_draft(id, draft)))
    }

    pub fn sheet(&self, id: ObjectId) -> Option<&Sheet> {
        self.state.sheets.get(&id)
    }

    /// Mutable access. The commit diffs the sheet against its committed
    /// version, so fetching without changing anything is harmless.
    pub fn sheet_mut(&mut self, id: ObjectId) -> Option<&mut Sheet> {
        let sheet = self.state.sheets.get_mut(&id)?;
        self.touched.insert(id);
        Some(sheet)
    }

    pub fn delete_sheet(&mut self, id: ObjectId) -> Option<Sheet> {
        let sheet = self.state.sheets.remove(&id)?;
        if !self.inserted.remove(&id) {
            self.deleted.insert(id, sheet.clone());
        }
        self.touched.remove(&id);
        Some(sheet)
    }

    pub fn find_by_remote_name(&self, name: &str) -> Option<ObjectId> {
        self.state
            .sheets
            .values()
            .find(|sheet| sheet.remote_name.as_deref() == Some(name))
            .map(|sheet| sheet.id)
    }

    pub fn find_by_key(&self, key: &str) -> Option<ObjectId> {
        self.state
            .sheets
            .values()
            .find(|sheet| sheet.key == key)
            .map(|sheet| sheet.id)
    }

    /// Look up a sheet by its current display name, falling back to the
    /// natural key it was created with. Case and spacing are ignored.
    pub fn find_by_name(&self, name: &str) -> Result<ObjectId> {
        let wanted = crate::model::natural_key(name);
        self.state
            .sheets
            .values()
            .find(|sheet| crate::model::natural_key(&sheet.name) == wanted)
            .map(|sheet| sheet.id)
            .or_else(|| self.find_by_key(&wanted))
            .ok_or_else(|| StoreError::UnknownSheet(name.to_string()))
    }

    pub fn select(&self, predicate: impl Fn(&Sheet) -> bool, limit: usize) -> Vec<&Sheet> {
        self.state
            .sheets
            .values()
            .filter(|sheet| predicate(sheet))
            .take(limit)
            .collect()
    }

    // ==================== Deletion instructions ====================

    pub fn add_pending_deletion(&mut self, record: RecordId) {
        if !self.state.pending_deletions.iter().any(|p| p.record == record) {
            self.state.pending_deletions.push(PendingDeletion { record });
        }
    }

    pub fn has_pending_deletion(&self, record: &RecordId) -> bool {
        self.state.pending_deletions.iter().any(|p| &p.record == record)
    }

    pub fn remove_pending_deletion(&mut self, record: &RecordId) -> bool {
        let before = self.state.pending_deletions.len();
        self.state.pending_deletions.retain(|p| &p.record != record);
        self.state.pending_deletions.len() != before
    }

    // ==================== Change tokens ====================

    pub fn change_token(&self, zone: &ZoneId) -> Option<&ChangeToken> {
        find_token(&self.state, zone)
    }

    pub fn set_change_token(&mut self, zone: &ZoneId, token: ChangeToken) {
        match self.state.change_tokens.iter_mut().find(|(z, _)| z == zone) {
            Some((_, existing)) => *existing = token,
            None => self.state.change_tokens.push((zone.clone(), token)),
        }
    }

    pub fn remove_change_token(&mut self, zone: &ZoneId) -> bool {
        let before = self.state.change_tokens.len();
        self.state.change_tokens.retain(|(z, _)| z != zone);
        self.state.change_tokens.len() != before
    }

    // ==================== Sync status ====================

    pub fn sync_status(&self) -> &SyncStatus {
        &self.state.sync_status
    }

    pub fn set_sync_status(&mut self, status: SyncStatus) {
        self.state.sync_status = status;
    }

    /// Produce the state to commit and the event describing it.
    fn finish(self, mapper: &RecordMapper, base: &StoreState) -> (StoreState, StoreEvent) {
        let Self {
            role,
            mut state,
            inserted,
            touched,
            deleted,
        } = self;

        let inserted: Vec<ObjectId> = inserted.into_iter().collect();
        let updated: Vec<ObjectId> = touched
            .into_iter()
            .filter(|id| !inserted.contains(id))
            .filter(|id| base.sheets.get(id) != state.sheets.get(id))
            .collect();
        let deleted: Vec<Sheet> = deleted.into_values().collect();

        if role == ContextRole::Interactive {
            tracker::track(
                mapper,
                base,
                &mut state,
                tracker::Changes {
                    inserted: &inserted,
                    updated: &updated,
                    deleted: &deleted,
                },
            );
        }

        let event = StoreEvent {
            origin: role,
            inserted,
            updated,
            deleted: deleted.iter().map(|sheet| sheet.id).collect(),
        };
        (state, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldKey, FieldMask};
    use crate::model::NewSheet;

    /// Dirty mask of a sheet as committed, or empty if the sheet is gone.
    async fn dirty_fields(store: &LocalStore, id: ObjectId) -> FieldMask {
        store.sheet(id).await.map(|s| s.dirty).unwrap_or_default()
    }

    fn zone() -> ZoneId {
        ZoneId::new("Sheets", "__defaultOwner__")
    }

    async fn add(store: &LocalStore, name: &str) -> ObjectId {
        store
            .transaction(ContextRole::Interactive, |tx| {
                tx.insert_sheet(NewSheet::named(name))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_interactive_insert_is_fully_dirty() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        let id = add(&store, "Groceries").await;
        assert_eq!(dirty_fields(&store, id).await, FieldMask::all());
    }

    #[tokio::test]
    async fn test_interactive_update_marks_changed_fields() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        let id = add(&store, "Groceries").await;
        store
            .transaction(ContextRole::Sync, |tx| -> Result<()> {
                if let Some(sheet) = tx.sheet_mut(id) {
                    sheet.dirty = FieldMask::empty();
                }
                Ok(())
            })
            .await
            .unwrap();

        store
            .transaction(ContextRole::Interactive, |tx| -> Result<()> {
                if let Some(sheet) = tx.sheet_mut(id) {
                    sheet.notes = "weekly".into();
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(dirty_fields(&store, id).await, FieldMask::from(FieldKey::Notes));
    }

    #[tokio::test]
    async fn test_sync_commits_never_mark_dirty() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        let id = store
            .transaction(ContextRole::Sync, |tx| -> Result<ObjectId> {
                Ok(tx.insert(|id| Sheet::from_draft(id, NewSheet::named("Remote"))))
            })
            .await
            .unwrap();
        assert!(dirty_fields(&store, id).await.is_empty());

        store
            .transaction(ContextRole::Sync, |tx| -> Result<()> {
                tx.delete_sheet(id);
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.pending_deletions(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_interactive_delete_leaves_instruction() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        let id = add(&store, "Groceries").await;

        store
            .transaction(ContextRole::Interactive, |tx| -> Result<()> {
                tx.delete_sheet(id);
                Ok(())
            })
            .await
            .unwrap();

        let pending = store.pending_deletions(10).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].record,
            RecordId::new(zone(), RecordMapper::record_name_for_key("groceries"))
        );
    }

    #[tokio::test]
    async fn test_recreating_a_deleted_sheet_drops_the_instruction() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        let id = add(&store, "Groceries").await;
        store
            .transaction(ContextRole::Interactive, |tx| -> Result<()> {
                tx.delete_sheet(id);
                Ok(())
            })
            .await
            .unwrap();

        add(&store, "groceries").await;
        assert!(store.pending_deletions(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_error_rolls_back() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        let result = store
            .transaction(ContextRole::Interactive, |tx| -> Result<()> {
                tx.insert_sheet(NewSheet::named("Groceries"))?;
                Err(StoreError::UnknownSheet("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.sheets().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        add(&store, "Groceries").await;
        let result = store
            .transaction(ContextRole::Interactive, |tx| {
                tx.insert_sheet(NewSheet::named("  GROCERIES "))
            })
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateSheet(_))));
    }

    #[tokio::test]
    async fn test_events_carry_origin() {
        let store = LocalStore::in_memory(zone()).await.unwrap();
        let mut events = store.subscribe();
        let id = add(&store, "Groceries").await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.origin, ContextRole::Interactive);
        assert_eq!(event.inserted, vec![id]);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_committed_state() {
        let fs = Arc::new(InMemoryFs::new());
        let store = LocalStore::open(fs.clone(), "store.json", zone())
            .await
            .unwrap();
        add(&store, "Groceries").await;

        fs.set_fail_writes(true);
        let result = store
            .transaction(ContextRole::Interactive, |tx| {
                tx.insert_sheet(NewSheet::named("Books"))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Fs(_))));
        assert_eq!(store.sheets().await.len(), 1);

        fs.set_fail_writes(false);
        let reopened = LocalStore::open(fs, "store.json", zone()).await.unwrap();
        let sheets = reopened.sheets().await;
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].name, "Groceries");
    }

    #[tokio::test]
    async fn test_change_tokens_persist() {
        let fs = Arc::new(InMemoryFs::new());
        let store = LocalStore::open(fs.clone(), "store.json", zone())
            .await
            .unwrap();
        store
            .transaction(ContextRole::Sync, |tx| -> Result<()> {
                tx.set_change_token(&zone(), ChangeToken::from_bytes(vec![7]));
                Ok(())
            })
            .await
            .unwrap();

        let reopened = LocalStore::open(fs, "store.json", zone()).await.unwrap();
        assert_eq!(
            reopened.change_token(&zone()).await,
            Some(ChangeToken::from_bytes(vec![7]))
        );
    }
}

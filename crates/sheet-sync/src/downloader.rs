//! Pulls remote changes into the local store.
//!
//! The whole change feed since the stored token is staged in memory, then
//! applied together with the new token in one sync-context transaction. A
//! crash anywhere before that commit leaves the old token paired with the
//! old data, so the next pull replays the same changes exactly once.

use crate::classify::{classify, Strategy};
use crate::env::SyncEnv;
use crate::error::Result;
use crate::fields::FieldKey;
use crate::mapper::{RecordMapper, RECORD_TYPE};
use crate::model::{ObjectId, Sheet};
use crate::processors::ensure_current;
use crate::remote::{ChangeSink, ChangeToken, FieldValue, RecordId, RemoteRecord};
use crate::store::{ContextRole, Transaction};

use tracing::{debug, info, warn};

/// What a pull did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Applied { changed: usize, deleted: usize },
    /// The stored token had expired and was dropped; pull again for a full
    /// fetch.
    TokenReset,
}

enum Change {
    Changed(RemoteRecord),
    Deleted(RecordId),
}

/// Change feed collected before anything is committed.
#[derive(Default)]
struct Staged {
    changes: Vec<Change>,
    token: Option<ChangeToken>,
}

impl ChangeSink for Staged {
    fn record_changed(&mut self, record: RemoteRecord) {
        self.changes.push(Change::Changed(record));
    }

    fn record_deleted(&mut self, id: RecordId) {
        self.changes.push(Change::Deleted(id));
    }

    fn token_updated(&mut self, token: ChangeToken) {
        self.token = Some(token);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Downloader;

impl Downloader {
    pub fn new() -> Self {
        Self
    }

    /// Fetch and apply every remote change since the stored token.
    pub async fn process_remote_changes(&self, env: &SyncEnv) -> Result<PullOutcome> {
        let zone = env.remote.zone().clone();
        let token = env.store.change_token(&zone).await;
        debug!(
            "Pulling {} from {}",
            zone,
            if token.is_some() { "stored token" } else { "the beginning" }
        );

        let mut staged = Staged::default();
        if let Err(error) = env.remote.fetch_changes(token, &mut staged).await {
            return match classify(&error, env.retry_delay) {
                Strategy::ResetChangeToken => {
                    warn!("Change token for {} expired; resetting", zone);
                    env.store
                        .transaction(ContextRole::Sync, |tx| -> Result<()> {
                            tx.remove_change_token(&zone);
                            Ok(())
                        })
                        .await?;
                    Ok(PullOutcome::TokenReset)
                }
                _ => Err(error.into()),
            };
        }
        ensure_current(env)?;

        let (changed, deleted) = env
            .store
            .transaction(ContextRole::Sync, |tx| -> Result<(usize, usize)> {
                let mut changed = 0;
                let mut deleted = 0;
                for change in &staged.changes {
                    match change {
                        Change::Changed(record) => {
                            if apply_changed(tx, record)? {
                                changed += 1;
                            }
                        }
                        Change::Deleted(id) => {
                            if apply_deleted(tx, id) {
                                deleted += 1;
                            }
                        }
                    }
                }
                if let Some(token) = &staged.token {
                    tx.set_change_token(&zone, token.clone());
                }
                Ok((changed, deleted))
            })
            .await?;

        if changed + deleted > 0 {
            info!("Pulled {} change(s), {} deletion(s)", changed, deleted);
        }
        Ok(PullOutcome::Applied { changed, deleted })
    }
}

/// Local sheet a remote record belongs to, creating one if needed.
fn local_counterpart(tx: &mut Transaction, record: &RemoteRecord) -> ObjectId {
    if let Some(id) = tx.find_by_remote_name(&record.id.name) {
        return id;
    }

    // Created independently on two devices before either synced.
    if let Some(FieldValue::String(key)) = record.fields.get(FieldKey::Key.name()) {
        let unlinked = tx
            .select(|sheet| sheet.remote_name.is_none() && &sheet.key == key, 1)
            .first()
            .map(|sheet| sheet.id);
        if let Some(id) = unlinked {
            debug!("Linking {} to local sheet {} by key {:?}", record.id, id, key);
            return id;
        }
    }

    tx.insert(Sheet::blank)
}

fn apply_changed(tx: &mut Transaction, record: &RemoteRecord) -> Result<bool> {
    if record.record_type != RECORD_TYPE {
        debug!("Ignoring {} of type {}", record.id, record.record_type);
        return Ok(false);
    }
    if tx.has_pending_deletion(&record.id) {
        debug!("Skipping {}: deleted locally", record.id);
        return Ok(false);
    }

    let id = local_counterpart(tx, record);
    let Some(sheet) = tx.sheet_mut(id) else {
        return Ok(false);
    };
    let skipping = sheet.dirty;
    RecordMapper::apply_remote_record(record, sheet, skipping)?;
    sheet.remote_name = Some(record.id.name.clone());
    if let Some(metadata) = RecordMapper::metadata_bytes(record)? {
        sheet.remote_metadata = Some(metadata);
    }
    Ok(true)
}

fn apply_deleted(tx: &mut Transaction, record: &RecordId) -> bool {
    tx.remove_pending_deletion(record);
    match tx.find_by_remote_name(&record.name) {
        Some(id) => tx.delete_sheet(id).is_some(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldMask;
    use crate::fs::FileSystem;
    use crate::model::NewSheet;
    use crate::remote::{RemoteError, RemoteOp};
    use crate::store::LocalStore;
    use crate::testing::Harness;
    use std::sync::Arc;

    fn remote_sheet(h: &Harness, name: &str) -> RemoteRecord {
        let sheet = Sheet::from_draft(ObjectId::new(999), NewSheet::named(name));
        h.env.mapper.to_remote_record(&sheet, FieldMask::all()).unwrap()
    }

    #[tokio::test]
    async fn test_pull_creates_local_sheets() {
        let h = Harness::new().await;
        h.remote.force_put(remote_sheet(&h, "Groceries"));

        let outcome = Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert_eq!(
            outcome,
            PullOutcome::Applied {
                changed: 1,
                deleted: 0
            }
        );

        let sheets = h.store.sheets().await;
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].name, "Groceries");
        assert!(sheets[0].is_uploaded());
        assert!(sheets[0].dirty.is_empty());
        assert!(h.store.change_token(h.env.remote.zone()).await.is_some());
    }

    #[tokio::test]
    async fn test_pull_never_clobbers_dirty_fields() {
        let h = Harness::new().await;
        let record = h.remote.force_put(remote_sheet(&h, "Groceries"));
        Downloader::new().process_remote_changes(&h.env).await.unwrap();
        let id = h.store.sheets().await[0].id;

        h.edit(id, |sheet| sheet.notes = "mine".into()).await;

        let mut theirs = record.clone();
        theirs
            .fields
            .insert("notes".into(), FieldValue::String("theirs".into()));
        theirs
            .fields
            .insert("sortOrder".into(), FieldValue::Int(4));
        h.remote.force_put(theirs);
        Downloader::new().process_remote_changes(&h.env).await.unwrap();

        let sheet = h.sheet(id).await;
        assert_eq!(sheet.notes, "mine");
        assert_eq!(sheet.sort_order, 4);
        assert_eq!(sheet.dirty, FieldMask::from(FieldKey::Notes));
    }

    #[tokio::test]
    async fn test_pull_links_by_natural_key() {
        let h = Harness::new().await;
        let id = h.add("Groceries").await;
        h.remote.force_put(remote_sheet(&h, "groceries"));

        Downloader::new().process_remote_changes(&h.env).await.unwrap();

        let sheets = h.store.sheets().await;
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].id, id);
        assert!(sheets[0].is_uploaded());
        // Local values were never uploaded, so they win.
        assert_eq!(sheets[0].name, "Groceries");
        assert_eq!(sheets[0].dirty, FieldMask::all());
    }

    #[tokio::test]
    async fn test_remote_edit_skips_locally_deleted_sheet() {
        let h = Harness::new().await;
        let record = h.remote.force_put(remote_sheet(&h, "Groceries"));
        Downloader::new().process_remote_changes(&h.env).await.unwrap();
        let id = h.store.sheets().await[0].id;
        h.delete(id).await;

        let mut theirs = record.clone();
        theirs
            .fields
            .insert("notes".into(), FieldValue::String("theirs".into()));
        h.remote.force_put(theirs);
        let outcome = Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert_eq!(
            outcome,
            PullOutcome::Applied {
                changed: 0,
                deleted: 0
            }
        );

        assert!(h.store.sheets().await.is_empty());
        let pending = h.store.pending_deletions(10).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record, record.id);
    }

    #[tokio::test]
    async fn test_remote_deletion_is_idempotent() {
        let h = Harness::new().await;
        let record = h.remote.force_put(remote_sheet(&h, "Groceries"));
        Downloader::new().process_remote_changes(&h.env).await.unwrap();

        h.remote.force_delete(&record.id);
        let outcome = Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert_eq!(
            outcome,
            PullOutcome::Applied {
                changed: 0,
                deleted: 1
            }
        );
        assert!(h.store.sheets().await.is_empty());
        assert!(h.store.pending_deletions(10).await.is_empty());

        let outcome = Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert_eq!(
            outcome,
            PullOutcome::Applied {
                changed: 0,
                deleted: 0
            }
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_dropped() {
        let h = Harness::new().await;
        h.remote.force_put(remote_sheet(&h, "Groceries"));
        Downloader::new().process_remote_changes(&h.env).await.unwrap();
        let zone = h.env.remote.zone().clone();
        assert!(h.store.change_token(&zone).await.is_some());

        h.remote.expire_change_tokens(&zone);
        let outcome = Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert_eq!(outcome, PullOutcome::TokenReset);
        assert!(h.store.change_token(&zone).await.is_none());

        Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert_eq!(h.remote.fetch_tokens().last(), Some(&None));
        assert_eq!(h.store.sheets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_token_commits_with_data() {
        let h = Harness::new().await;
        h.remote.force_put(remote_sheet(&h, "Groceries"));

        // The commit fails as if the process died before the write.
        h.fs.set_fail_writes(true);
        assert!(Downloader::new().process_remote_changes(&h.env).await.is_err());
        h.fs.set_fail_writes(false);

        // Restart from disk: neither the sheet nor the token survived.
        let fs: Arc<dyn FileSystem> = h.fs.clone();
        let reopened = LocalStore::open(fs, "store.json", h.env.remote.zone().clone())
            .await
            .unwrap();
        assert!(reopened.change_token(h.env.remote.zone()).await.is_none());
        assert!(reopened.sheets().await.is_empty());

        // Replaying from the old token applies the change exactly once.
        Downloader::new().process_remote_changes(&h.env).await.unwrap();
        Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert_eq!(h.store.sheets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_fetch_error_propagates() {
        let h = Harness::new().await;
        h.remote
            .inject_failure(RemoteOp::Fetch, RemoteError::NetworkFailure);
        assert!(Downloader::new().process_remote_changes(&h.env).await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_record_types_are_ignored() {
        let h = Harness::new().await;
        let mut record = remote_sheet(&h, "Groceries");
        record.record_type = "Row".into();
        h.remote.force_put(record);

        Downloader::new().process_remote_changes(&h.env).await.unwrap();
        assert!(h.store.sheets().await.is_empty());
    }
}

use super::inserter::confirmed_fields;
use super::{ensure_current, item_action, settle, BatchSize, ItemAction, Scope};
use crate::env::SyncEnv;
use crate::error::{Result, SyncError};
use crate::mapper::RecordMapper;
use crate::model::{ObjectId, Sheet};
use crate::remote::{RemoteError, RemoteRecord};
use crate::store::ContextRole;

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Sends the dirty fields of uploaded sheets.
pub struct Updater {
    batch: BatchSize,
}

impl Updater {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch: BatchSize::new(batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch.get()
    }

    /// Uploaded sheets in `scope` with unsynced edits that nobody else owns.
    pub async fn select_pending(
        &self,
        env: &SyncEnv,
        scope: &Scope,
        skip: &HashSet<ObjectId>,
        limit: usize,
    ) -> Vec<Sheet> {
        env.store
            .select(
                |sheet| {
                    sheet.remote_name.is_some()
                        && !sheet.dirty.is_empty()
                        && scope.includes(sheet.id)
                        && !skip.contains(&sheet.id)
                        && !env.objects_in_flight.contains(&sheet.id)
                },
                limit,
            )
            .await
    }

    pub(super) async fn run(&self, env: &SyncEnv, scope: &Scope) -> Result<usize> {
        let mut attempted = HashSet::new();
        let mut pushed = 0;

        loop {
            let candidates = self
                .select_pending(env, scope, &attempted, self.batch.get())
                .await;
            if candidates.is_empty() {
                return Ok(pushed);
            }

            let claim = env
                .objects_in_flight
                .claim(candidates.iter().map(|sheet| sheet.id));
            let sheets: Vec<Sheet> = candidates
                .into_iter()
                .filter(|sheet| claim.keys().contains(&sheet.id))
                .collect();
            attempted.extend(sheets.iter().map(|sheet| sheet.id));

            match self.process(env, &sheets).await? {
                Some(count) => pushed += count,
                None => {
                    for sheet in &sheets {
                        attempted.remove(&sheet.id);
                    }
                }
            }
            drop(claim);
        }
    }

    async fn process(&self, env: &SyncEnv, sheets: &[Sheet]) -> Result<Option<usize>> {
        if sheets.is_empty() {
            return Ok(Some(0));
        }

        let mut uploads: BTreeMap<String, (ObjectId, RemoteRecord)> = BTreeMap::new();
        for sheet in sheets {
            let record = env.mapper.to_remote_record(sheet, sheet.dirty)?;
            debug!("Updating {} fields {}", record.id, sheet.dirty);
            uploads.insert(record.id.name.clone(), (sheet.id, record));
        }
        let records: Vec<RemoteRecord> = uploads.values().map(|(_, r)| r.clone()).collect();

        let result = env.remote.upload(records).await;
        let Some(outcome) = settle(env, &self.batch, result, |saved| saved)? else {
            return Ok(None);
        };
        ensure_current(env)?;

        let mut vanished = Vec::new();
        let mut escalate: Option<RemoteError> = None;
        for (id, error) in outcome.failures {
            match item_action(env, &id, error) {
                // Stays dirty; the next pull brings the newer server copy
                // and the push after it retries.
                ItemAction::Defer => {}
                ItemAction::Vanished => {
                    warn!("{} vanished remotely; will recreate", id);
                    if let Some((object, _)) = uploads.get(&id.name) {
                        vanished.push(*object);
                    }
                }
                ItemAction::Escalate(error) => {
                    escalate.get_or_insert(error);
                }
            }
        }

        let count = outcome.done.len();
        env.store
            .transaction(ContextRole::Sync, |tx| -> Result<()> {
                for saved in &outcome.done {
                    let Some((object, sent)) = uploads.get(&saved.id.name) else {
                        continue;
                    };
                    let Some(sheet) = tx.sheet_mut(*object) else {
                        continue;
                    };
                    if let Some(metadata) = RecordMapper::metadata_bytes(saved)? {
                        sheet.remote_metadata = Some(metadata);
                    }
                    let confirmed = confirmed_fields(sheet, sent)?;
                    sheet.dirty = sheet.dirty.difference(confirmed);
                }
                for object in &vanished {
                    if let Some(sheet) = tx.sheet_mut(*object) {
                        sheet.clear_remote_identity();
                    }
                }
                Ok(())
            })
            .await?;

        if count > 0 {
            info!("Updated {} record(s)", count);
        }
        match escalate {
            Some(error) => Err(SyncError::Remote(error)),
            None => Ok(Some(count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldKey, FieldMask};
    use crate::processors::Inserter;
    use crate::remote::{FieldValue, RemoteOp};
    use crate::testing::Harness;

    async fn uploaded(h: &Harness, name: &str) -> ObjectId {
        let id = h.add(name).await;
        Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();
        assert!(h.sheet(id).await.dirty.is_empty());
        id
    }

    #[tokio::test]
    async fn test_update_sends_only_dirty_field() {
        let h = Harness::new().await;
        let id = uploaded(&h, "Groceries").await;
        h.edit(id, |sheet| sheet.notes = "weekly".into()).await;
        assert_eq!(h.sheet(id).await.dirty, FieldMask::from(FieldKey::Notes));

        let hold = h.remote.hold_next_save();
        let env = h.env.clone();
        let task = tokio::spawn(async move { Updater::new(10).run(&env, &Scope::All).await });
        hold.arrived().await;
        hold.release();
        assert_eq!(task.await.unwrap().unwrap(), 1);

        assert!(h.sheet(id).await.dirty.is_empty());
        let record = h.remote_copy(id).await;
        assert_eq!(
            record.fields.get("notes"),
            Some(&FieldValue::String("weekly".into()))
        );
    }

    #[tokio::test]
    async fn test_delta_contains_only_dirty_fields() {
        let h = Harness::new().await;
        let id = uploaded(&h, "Groceries").await;
        h.edit(id, |sheet| sheet.sort_order = 9).await;

        let sheet = h.sheet(id).await;
        let record = h.env.mapper.to_remote_record(&sheet, sheet.dirty).unwrap();
        assert_eq!(record.fields.keys().collect::<Vec<_>>(), vec!["sortOrder"]);
        assert!(record.metadata.is_some());
    }

    #[tokio::test]
    async fn test_edit_during_upload_stays_dirty() {
        let h = Harness::new().await;
        let id = uploaded(&h, "Groceries").await;
        h.edit(id, |sheet| sheet.notes = "v1".into()).await;

        let hold = h.remote.hold_next_save();
        let env = h.env.clone();
        let task = tokio::spawn(async move { Updater::new(10).run(&env, &Scope::All).await });

        hold.arrived().await;
        h.edit(id, |sheet| sheet.notes = "v2".into()).await;
        hold.release();
        task.await.unwrap().unwrap();

        let sheet = h.sheet(id).await;
        assert!(sheet.dirty.contains(FieldKey::Notes));
        assert_eq!(sheet.notes, "v2");
    }

    #[tokio::test]
    async fn test_conflict_leaves_item_dirty() {
        let h = Harness::new().await;
        let id = uploaded(&h, "Groceries").await;
        let mut theirs = h.remote_copy(id).await;
        theirs
            .fields
            .insert("name".into(), FieldValue::String("Food".into()));
        h.remote.force_put(theirs);

        h.edit(id, |sheet| sheet.notes = "mine".into()).await;
        let pushed = Updater::new(10).run(&h.env, &Scope::All).await.unwrap();

        assert_eq!(pushed, 0);
        assert_eq!(h.sheet(id).await.dirty, FieldMask::from(FieldKey::Notes));
    }

    #[tokio::test]
    async fn test_vanished_record_drops_remote_identity() {
        let h = Harness::new().await;
        let id = uploaded(&h, "Groceries").await;
        let record = h.remote_copy(id).await;
        h.remote.force_delete(&record.id);

        h.edit(id, |sheet| sheet.notes = "mine".into()).await;
        Updater::new(10).run(&h.env, &Scope::All).await.unwrap();

        let sheet = h.sheet(id).await;
        assert!(!sheet.is_uploaded());
        assert_eq!(sheet.dirty, FieldMask::all());
    }

    #[tokio::test]
    async fn test_shrinks_batch_and_retries() {
        let h = Harness::new().await;
        for i in 0..4 {
            let id = uploaded(&h, &format!("Sheet {i}")).await;
            h.edit(id, |sheet| sheet.notes = "x".into()).await;
        }
        h.remote.set_max_batch_size(Some(2));

        let updater = Updater::new(4);
        let pushed = updater.run(&h.env, &Scope::All).await.unwrap();

        assert_eq!(pushed, 4);
        assert_eq!(updater.batch_size(), 2);
    }

    #[tokio::test]
    async fn test_account_error_escalates() {
        let h = Harness::new().await;
        let id = uploaded(&h, "Groceries").await;
        h.edit(id, |sheet| sheet.notes = "x".into()).await;
        h.remote
            .inject_failure(RemoteOp::Save, RemoteError::QuotaExceeded);

        let err = Updater::new(10).run(&h.env, &Scope::All).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::QuotaExceeded)));
        assert!(!h.sheet(id).await.dirty.is_empty());
    }
}

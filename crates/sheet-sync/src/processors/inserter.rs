use super::{ensure_current, item_action, settle, BatchSize, ItemAction, Scope};
use crate::env::SyncEnv;
use crate::error::{Result, SyncError};
use crate::fields::FieldMask;
use crate::mapper::RecordMapper;
use crate::model::{ObjectId, Sheet};
use crate::remote::{RemoteError, RemoteRecord};
use crate::store::ContextRole;

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Creates remote records for sheets that have none.
pub struct Inserter {
    batch: BatchSize,
}

impl Inserter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch: BatchSize::new(batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch.get()
    }

    /// Sheets in `scope` without a remote identity that nobody else owns.
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
                    sheet.remote_name.is_none()
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

    /// Upload one batch. `None` if the batch was too large.
    async fn process(&self, env: &SyncEnv, sheets: &[Sheet]) -> Result<Option<usize>> {
        if sheets.is_empty() {
            return Ok(Some(0));
        }

        // Never uploaded, so every field goes out and no metadata does.
        let mut uploads: BTreeMap<String, (Sheet, RemoteRecord)> = BTreeMap::new();
        for sheet in sheets {
            let mut record = env.mapper.to_remote_record(sheet, FieldMask::all())?;
            record.metadata = None;
            uploads.insert(record.id.name.clone(), (sheet.clone(), record));
        }
        let records: Vec<RemoteRecord> = uploads.values().map(|(_, r)| r.clone()).collect();
        debug!("Inserting {} record(s)", records.len());

        let result = env.remote.upload(records).await;
        let Some(outcome) = settle(env, &self.batch, result, |saved| saved)? else {
            return Ok(None);
        };
        ensure_current(env)?;

        let mut escalate: Option<RemoteError> = None;
        let mut taken = Vec::new();
        for (id, error) in outcome.failures {
            // The name already exists remotely: another device created the
            // sheet first, or a deletion of the same name never got out. The
            // change feed may never mention that record again, so link to it
            // now.
            if error == RemoteError::ServerRecordChanged {
                taken.push(id);
                continue;
            }
            match item_action(env, &id, error) {
                ItemAction::Defer | ItemAction::Vanished => {}
                ItemAction::Escalate(error) => {
                    escalate.get_or_insert(error);
                }
            }
        }
        let existing = match env.remote.fetch_records(taken).await {
            Ok(records) => records,
            Err(error) => {
                escalate.get_or_insert(error);
                Vec::new()
            }
        };
        ensure_current(env)?;

        let count = outcome.done.len();
        env.store
            .transaction(ContextRole::Sync, |tx| -> Result<()> {
                for saved in &outcome.done {
                    let Some((local, sent)) = uploads.get(&saved.id.name) else {
                        continue;
                    };
                    // Deleted while the upload was in flight: the deletion
                    // instruction takes care of the record.
                    let Some(sheet) = tx.sheet_mut(local.id) else {
                        continue;
                    };
                    let metadata = RecordMapper::metadata_bytes(saved)?.unwrap_or_default();
                    sheet.set_remote_identity(saved.id.name.clone(), metadata);

                    let confirmed = confirmed_fields(sheet, sent)?;
                    sheet.dirty = sheet.dirty.difference(confirmed);
                    let diverged = RecordMapper::diverged_fields(saved, sheet, confirmed)?;
                    if !diverged.is_empty() {
                        debug!("Server changed {} of {}; re-marking", diverged, saved.id);
                    }
                    sheet.dirty |= diverged;
                }

                // Local values win: the dirty mask is kept so the updater
                // overwrites the existing record.
                for record in &existing {
                    let Some((local, _)) = uploads.get(&record.id.name) else {
                        continue;
                    };
                    let Some(sheet) = tx.sheet_mut(local.id) else {
                        continue;
                    };
                    if sheet.is_uploaded() {
                        continue;
                    }
                    let skipping = sheet.dirty;
                    RecordMapper::apply_remote_record(record, sheet, skipping)?;
                    let metadata = RecordMapper::metadata_bytes(record)?.unwrap_or_default();
                    sheet.set_remote_identity(record.id.name.clone(), metadata);
                    debug!("Linked sheet {} to existing {}", local.id, record.id);
                }
                Ok(())
            })
            .await?;

        if count > 0 {
            info!("Inserted {} record(s)", count);
        }
        match escalate {
            Some(error) => Err(SyncError::Remote(error)),
            None => Ok(Some(count)),
        }
    }
}

/// Fields of `sent` whose value still equals the sheet's current value.
///
/// A field edited again during the round-trip stays dirty.
pub(super) fn confirmed_fields(sheet: &Sheet, sent: &RemoteRecord) -> Result<FieldMask> {
    let mut confirmed = FieldMask::empty();
    for key in crate::fields::FieldKey::ALL.iter().copied() {
        let Some(value) = sent.fields.get(key.name()) else {
            continue;
        };
        if &RecordMapper::field_value(sheet, key)? == value {
            confirmed.insert(key);
        }
    }
    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::Updater;
    use crate::remote::{FieldValue, RemoteDatabase, RemoteOp};
    use crate::testing::Harness;

    #[tokio::test]
    async fn test_insert_clears_mask_and_sets_identity() {
        let h = Harness::new().await;
        let id = h.add("Groceries").await;
        assert_eq!(h.sheet(id).await.dirty, FieldMask::all());

        let pushed = Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();
        assert_eq!(pushed, 1);

        let sheet = h.sheet(id).await;
        assert!(sheet.dirty.is_empty());
        assert_eq!(
            sheet.remote_name.as_deref(),
            Some(RecordMapper::record_name_for_key("groceries").as_str())
        );
        assert!(sheet.remote_metadata.is_some());
        assert_eq!(h.remote.records(h.env.remote.zone()).len(), 1);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let h = Harness::new().await;
        let id = h.add("Groceries").await;

        // The first attempt reaches the server but the reply is lost.
        h.remote
            .save_records(vec![h
                .env
                .mapper
                .to_remote_record(&h.sheet(id).await, FieldMask::all())
                .unwrap()])
            .await
            .unwrap();

        Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();
        Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();

        assert_eq!(h.remote.records(h.env.remote.zone()).len(), 1);
        // Linked to the orphaned record, still dirty until the updater runs.
        let sheet = h.sheet(id).await;
        assert!(sheet.is_uploaded());
        assert_eq!(sheet.dirty, FieldMask::all());
    }

    #[tokio::test]
    async fn test_recreated_sheet_links_to_undeleted_record() {
        let h = Harness::new().await;
        let old = h.add("Groceries").await;
        Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();

        // Deleted and recreated offline: the deletion never reaches the server.
        h.delete(old).await;
        let id = h.add("Groceries").await;
        h.edit(id, |sheet| sheet.notes = "fresh".into()).await;
        assert!(h.store.pending_deletions(10).await.is_empty());

        let pushed = Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();
        assert_eq!(pushed, 0);
        let sheet = h.sheet(id).await;
        assert!(sheet.is_uploaded());
        assert_eq!(sheet.notes, "fresh");
        assert_eq!(sheet.dirty, FieldMask::all());

        let pushed = Updater::new(10).run(&h.env, &Scope::All).await.unwrap();
        assert_eq!(pushed, 1);
        assert!(h.sheet(id).await.dirty.is_empty());
        assert_eq!(
            h.remote_copy(id).await.fields.get("notes"),
            Some(&FieldValue::String("fresh".into()))
        );
        assert_eq!(h.remote.records(h.env.remote.zone()).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_escalates_after_commit() {
        let h = Harness::new().await;
        let taken = h.add("Groceries").await;
        h.remote.force_put(
            h.env
                .mapper
                .to_remote_record(&h.sheet(taken).await, FieldMask::all())
                .unwrap(),
        );
        let fresh = h.add("Chores").await;
        h.remote
            .inject_failure(RemoteOp::Lookup, RemoteError::NetworkFailure);

        let err = Inserter::new(10).run(&h.env, &Scope::All).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::NetworkFailure)));
        assert!(h.sheet(fresh).await.is_uploaded());
        assert!(!h.sheet(taken).await.is_uploaded());
    }

    #[tokio::test]
    async fn test_server_canonicalization_re_marks_field() {
        let h = Harness::new().await;
        h.remote.set_canonicalizer(|record| {
            if let Some(FieldValue::String(name)) = record.fields.get_mut("name") {
                *name = name.trim().to_string();
            }
        });
        let id = h.add(" Groceries ").await;

        Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();

        let sheet = h.sheet(id).await;
        assert!(sheet.is_uploaded());
        assert_eq!(sheet.dirty, FieldMask::from(crate::fields::FieldKey::Name));
    }

    #[tokio::test]
    async fn test_scope_limits_selection() {
        let h = Harness::new().await;
        let a = h.add("A").await;
        let b = h.add("B").await;

        let scope = Scope::Objects([a].into_iter().collect());
        Inserter::new(10).run(&h.env, &scope).await.unwrap();

        assert!(h.sheet(a).await.is_uploaded());
        assert!(!h.sheet(b).await.is_uploaded());
    }

    #[tokio::test]
    async fn test_transient_error_escalates() {
        let h = Harness::new().await;
        let id = h.add("Groceries").await;
        h.remote
            .inject_failure(RemoteOp::Save, RemoteError::NetworkUnavailable);

        let err = Inserter::new(10).run(&h.env, &Scope::All).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::NetworkUnavailable)));
        assert_eq!(h.sheet(id).await.dirty, FieldMask::all());
        assert!(h.env.objects_in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_objects_are_skipped() {
        let h = Harness::new().await;
        let id = h.add("Groceries").await;
        let _claim = h.env.objects_in_flight.claim([id]);

        let pushed = Inserter::new(10).run(&h.env, &Scope::All).await.unwrap();
        assert_eq!(pushed, 0);
        assert!(h.remote.save_batch_sizes().is_empty());
    }
}

//! Dirty tracking for commits of the interactive context.

use super::StoreState;
use crate::fields::{FieldKey, FieldMask};
use crate::mapper::RecordMapper;
use crate::model::{ObjectId, PendingDeletion, Sheet};

/// Syncable fields whose value differs between two versions of a sheet.
pub fn changed_fields(old: &Sheet, new: &Sheet) -> FieldMask {
    FieldKey::ALL
        .iter()
        .copied()
        .filter(|key| match key {
            FieldKey::Key => old.key != new.key,
            FieldKey::Name => old.name != new.name,
            FieldKey::Notes => old.notes != new.notes,
            FieldKey::SortOrder => old.sort_order != new.sort_order,
            FieldKey::Columns => old.columns != new.columns,
            FieldKey::CreatedAt => old.created_at != new.created_at,
            FieldKey::ModifiedAt => old.modified_at != new.modified_at,
        })
        .collect()
}

/// Objects a transaction inserted, updated or deleted, relative to the
/// committed state it started from.
pub(super) struct Changes<'a> {
    pub inserted: &'a [ObjectId],
    pub updated: &'a [ObjectId],
    pub deleted: &'a [Sheet],
}

/// Fold an interactive commit into sync bookkeeping.
///
/// New sheets become fully dirty, edited sheets get the bits of their
/// changed fields, deleted sheets leave a deletion instruction behind.
pub(super) fn track(mapper: &RecordMapper, base: &StoreState, next: &mut StoreState, changes: Changes<'_>) {
    for id in changes.inserted {
        let Some(sheet) = next.sheets.get_mut(id) else {
            continue;
        };
        sheet.dirty = FieldMask::all();
        // Recreating a deleted sheet reuses its record; the old instruction
        // would delete the new one.
        let record = mapper.record_id(sheet);
        next.pending_deletions.retain(|p| p.record != record);
    }

    for id in changes.updated {
        let (Some(old), Some(new)) = (base.sheets.get(id), next.sheets.get_mut(id)) else {
            continue;
        };
        let changed = changed_fields(old, new);
        new.dirty |= changed;
    }

    for sheet in changes.deleted {
        let record = mapper.record_id(sheet);
        if !next.pending_deletions.iter().any(|p| p.record == record) {
            next.pending_deletions.push(PendingDeletion { record });
        }
    }
}

//! Sheet edits issued from the command line.
//!
//! Every edit runs as one interactive-context transaction, so the store's
//! tracker marks exactly the touched fields dirty.

use serde::Serialize;
use sheet_sync::model::natural_key;
use sheet_sync::store::StoreError;
use sheet_sync::{ColumnSpec, ContextRole, LocalStore, NewSheet, ObjectId, Sheet, SyncStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Sheet names cannot be empty")]
    EmptyName,

    #[error("Sheet {sheet:?} already has a column {column:?}")]
    DuplicateColumn { sheet: String, column: String },
}

pub type Result<T> = std::result::Result<T, CommandError>;

fn check_name(name: &str) -> Result<()> {
    if natural_key(name).is_empty() {
        return Err(CommandError::EmptyName);
    }
    Ok(())
}

/// Apply `edit` to the sheet currently called `name`.
async fn edit_sheet<T>(
    store: &LocalStore,
    name: &str,
    edit: impl FnOnce(&mut Sheet) -> Result<T>,
) -> Result<T> {
    store
        .transaction(ContextRole::Interactive, |tx| -> Result<T> {
            let id = tx.find_by_name(name)?;
            let sheet = tx
                .sheet_mut(id)
                .ok_or_else(|| StoreError::UnknownSheet(name.to_string()))?;
            let value = edit(sheet)?;
            sheet.touch();
            Ok(value)
        })
        .await
}

pub async fn add_sheet(store: &LocalStore, name: &str, notes: Option<String>) -> Result<ObjectId> {
    check_name(name)?;
    let sort_order = store
        .sheets()
        .await
        .iter()
        .map(|sheet| sheet.sort_order + 1)
        .max()
        .unwrap_or(0);
    let draft = NewSheet {
        name: name.trim().to_string(),
        notes: notes.unwrap_or_default(),
        sort_order,
        columns: Vec::new(),
    };
    store
        .transaction(ContextRole::Interactive, |tx| -> Result<ObjectId> {
            Ok(tx.insert_sheet(draft)?)
        })
        .await
}

pub async fn rename_sheet(store: &LocalStore, name: &str, new_name: &str) -> Result<()> {
    check_name(new_name)?;
    edit_sheet(store, name, |sheet| {
        sheet.name = new_name.trim().to_string();
        Ok(())
    })
    .await
}

pub async fn set_notes(store: &LocalStore, name: &str, notes: &str) -> Result<()> {
    edit_sheet(store, name, |sheet| {
        sheet.notes = notes.to_string();
        Ok(())
    })
    .await
}

pub async fn add_column(store: &LocalStore, name: &str, column: &str) -> Result<()> {
    edit_sheet(store, name, |sheet| {
        if sheet.columns.iter().any(|c| c.title.eq_ignore_ascii_case(column)) {
            return Err(CommandError::DuplicateColumn {
                sheet: sheet.name.clone(),
                column: column.to_string(),
            });
        }
        sheet.columns.push(ColumnSpec::text(column));
        Ok(())
    })
    .await
}

pub async fn delete_sheet(store: &LocalStore, name: &str) -> Result<()> {
    store
        .transaction(ContextRole::Interactive, |tx| -> Result<()> {
            let id = tx.find_by_name(name)?;
            tx.delete_sheet(id);
            Ok(())
        })
        .await
}

/// One line of `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub name: String,
    pub notes: String,
    pub columns: Vec<String>,
    pub uploaded: bool,
    /// Fields edited locally and not yet uploaded
    pub dirty: Vec<&'static str>,
}

impl From<&Sheet> for SheetSummary {
    fn from(sheet: &Sheet) -> Self {
        Self {
            name: sheet.name.clone(),
            notes: sheet.notes.clone(),
            columns: sheet.columns.iter().map(|c| c.title.clone()).collect(),
            uploaded: sheet.is_uploaded(),
            dirty: sheet.dirty.iter().map(|key| key.name()).collect(),
        }
    }
}

pub async fn list(store: &LocalStore) -> Vec<SheetSummary> {
    store.sheets().await.iter().map(SheetSummary::from).collect()
}

/// What `status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: SyncStatus,
    pub sheets: usize,
    pub dirty_sheets: usize,
    pub pending_deletions: usize,
    pub has_change_token: bool,
}

pub async fn status(store: &LocalStore, zone: &sheet_sync::ZoneId) -> StatusReport {
    let sheets = store.sheets().await;
    StatusReport {
        status: store.sync_status().await,
        sheets: sheets.len(),
        dirty_sheets: sheets.iter().filter(|s| !s.dirty.is_empty()).count(),
        pending_deletions: store.pending_deletions(usize::MAX).await.len(),
        has_change_token: store.change_token(zone).await.is_some(),
    }
}

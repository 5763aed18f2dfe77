//! Remote database kept in a directory shared by every device.
//!
//! Wraps `InMemoryRemote`: the database is reloaded from `remote.json` before
//! each operation and written back (tmp file plus rename) after every
//! operation that can change it. Operations from one process are serialized;
//! separate processes must not sync against the same directory at once.

use async_trait::async_trait;
use sheet_sync::fs::{FileSystem, FsError};
use sheet_sync::remote::{
    ChangeToken, ChangesPage, InMemoryRemote, RecordId, RemoteDatabase, RemoteError,
    RemoteRecord, RemoteState, Result, ZoneId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::native_fs::NativeFs;

const REMOTE_FILE: &str = "remote.json";
const REMOTE_TMP_FILE: &str = "remote.json.tmp";

pub struct DirRemote {
    fs: Arc<dyn FileSystem>,
    db: InMemoryRemote,
    io: Mutex<()>,
}

impl DirRemote {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            db: InMemoryRemote::new(),
            io: Mutex::new(()),
        }
    }

    /// Remote stored in `dir` on disk.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(NativeFs::new(dir)))
    }

    /// The wrapped database, holding whatever state was loaded last.
    pub fn database(&self) -> &InMemoryRemote {
        &self.db
    }

    async fn load(&self) -> Result<()> {
        if !self.fs.exists(REMOTE_FILE).await.map_err(dir_unavailable)? {
            self.db.replace_state(RemoteState::default());
            return Ok(());
        }
        let bytes = self.fs.read(REMOTE_FILE).await.map_err(dir_unavailable)?;
        let state: RemoteState = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("{} is corrupt: {}", REMOTE_FILE, e);
            RemoteError::Unknown(format!("corrupt {}: {}", REMOTE_FILE, e))
        })?;
        self.db.replace_state(state);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.db.export_state())
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;
        self.fs
            .write(REMOTE_TMP_FILE, &bytes)
            .await
            .map_err(dir_unavailable)?;
        self.fs
            .rename(REMOTE_TMP_FILE, REMOTE_FILE)
            .await
            .map_err(dir_unavailable)?;
        debug!("Saved {} ({} bytes)", REMOTE_FILE, bytes.len());
        Ok(())
    }
}

/// Directory I/O failures look like an unreachable server to the engine.
fn dir_unavailable(e: FsError) -> RemoteError {
    warn!("Remote directory unavailable: {}", e);
    RemoteError::NetworkFailure
}

#[async_trait]
impl RemoteDatabase for DirRemote {
    async fn fetch_zones(&self) -> Result<Vec<ZoneId>> {
        let _io = self.io.lock().await;
        self.load().await?;
        self.db.fetch_zones().await
    }

    async fn save_zone(&self, zone: &ZoneId) -> Result<()> {
        let _io = self.io.lock().await;
        self.load().await?;
        let result = self.db.save_zone(zone).await;
        self.save().await?;
        result
    }

    async fn fetch_subscriptions(&self) -> Result<Vec<String>> {
        let _io = self.io.lock().await;
        self.load().await?;
        self.db.fetch_subscriptions().await
    }

    async fn save_subscription(&self, id: &str, zone: &ZoneId) -> Result<()> {
        let _io = self.io.lock().await;
        self.load().await?;
        let result = self.db.save_subscription(id, zone).await;
        self.save().await?;
        result
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        since: Option<&ChangeToken>,
        limit: usize,
    ) -> Result<ChangesPage> {
        let _io = self.io.lock().await;
        self.load().await?;
        self.db.fetch_zone_changes(zone, since, limit).await
    }

    async fn save_records(&self, records: Vec<RemoteRecord>) -> Result<Vec<RemoteRecord>> {
        let _io = self.io.lock().await;
        self.load().await?;
        // Written back even on failure: a partial failure saved some records.
        let result = self.db.save_records(records).await;
        self.save().await?;
        result
    }

    async fn fetch_records(&self, ids: Vec<RecordId>) -> Result<Vec<RemoteRecord>> {
        let _io = self.io.lock().await;
        self.load().await?;
        self.db.fetch_records(ids).await
    }

    async fn delete_records(&self, ids: Vec<RecordId>) -> Result<Vec<RecordId>> {
        let _io = self.io.lock().await;
        self.load().await?;
        let result = self.db.delete_records(ids).await;
        self.save().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheet_sync::fs::InMemoryFs;

    fn zone() -> ZoneId {
        ZoneId::new("Sheets", "__defaultOwner__")
    }

    fn record(name: &str) -> RemoteRecord {
        RemoteRecord::new(RecordId::new(zone(), name), "Sheet")
    }

    #[tokio::test]
    async fn test_writes_are_visible_to_other_instances() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFs::new());
        let a = DirRemote::new(fs.clone());
        let b = DirRemote::new(fs.clone());

        a.save_zone(&zone()).await.unwrap();
        a.save_records(vec![record("sheet-1")]).await.unwrap();

        assert_eq!(b.fetch_zones().await.unwrap(), vec![zone()]);
        let page = b.fetch_zone_changes(&zone(), None, 10).await.unwrap();
        assert_eq!(page.changed.len(), 1);
        assert!(fs.exists(REMOTE_FILE).await.unwrap());
        assert!(!fs.exists(REMOTE_TMP_FILE).await.unwrap());
    }

    #[tokio::test]
    async fn test_conflicts_survive_the_round_trip() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFs::new());
        let a = DirRemote::new(fs.clone());
        let b = DirRemote::new(fs);

        a.save_zone(&zone()).await.unwrap();
        a.save_records(vec![record("sheet-1")]).await.unwrap();

        // `b` has never seen the record, so creating it again conflicts.
        let err = b.save_records(vec![record("sheet-1")]).await.unwrap_err();
        assert!(matches!(err, RemoteError::PartialFailure { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_not_retryable() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write(REMOTE_FILE, b"not json").await.unwrap();
        let remote = DirRemote::new(fs);

        assert!(matches!(
            remote.fetch_zones().await,
            Err(RemoteError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_unwritable_directory_looks_like_network_failure() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = DirRemote::new(fs.clone());
        fs.set_fail_writes(true);

        assert_eq!(
            remote.save_zone(&zone()).await,
            Err(RemoteError::NetworkFailure)
        );
    }
}

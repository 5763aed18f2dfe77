//! sheet-syncd library - exposes modules for testing.
//!
//! This is a thin library layer over the daemon components, so integration
//! tests can drive two devices against one shared remote directory.

pub mod commands;
pub mod dir_remote;
pub mod native_fs;

pub use dir_remote::DirRemote;
pub use native_fs::NativeFs;

use sheet_sync::store::Result;
use sheet_sync::{LocalStore, SyncConfig, SyncCoordinator};
use std::path::PathBuf;
use std::sync::Arc;

/// Store file inside a device's data directory.
pub const STORE_FILE: &str = "store.json";

/// One device: its store on disk, the shared remote, and a coordinator
/// wired between them.
pub struct Device {
    pub store: LocalStore,
    pub remote: Arc<DirRemote>,
    pub coordinator: SyncCoordinator,
}

impl Device {
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        remote_dir: impl Into<PathBuf>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let fs = Arc::new(NativeFs::new(data_dir));
        let store = LocalStore::open(fs, STORE_FILE, config.zone()).await?;
        let remote = Arc::new(DirRemote::open(remote_dir));
        let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), config);
        Ok(Self {
            store,
            remote,
            coordinator,
        })
    }

    /// One start, full cycle, stop. Returns what the cycle moved.
    pub async fn sync_once(&self) -> sheet_sync::Result<sheet_sync::CycleReport> {
        let report = self.coordinator.start().await;
        self.coordinator.stop();
        report.map(Option::unwrap_or_default)
    }
}

//! FileSystem trait abstraction for the local store's durable backing file.
//!
//! Implementations:
//! - `InMemoryFs` - For testing (supports write-failure injection to simulate crashes)
//! - `NativeFs` (in sheet-syncd) - Uses tokio::fs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Platform-independent filesystem abstraction.
///
/// Implementations must be `Send + Sync`: the store is shared between the
/// interactive side of the app and the background sync tasks.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Atomically replace `to` with `from`
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    /// When set, every write fails as if the process died mid-commit
    fail_writes: AtomicBool,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FsError::Io(format!("simulated write failure: {path}")));
        }
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let content = files.remove(&from).ok_or_else(|| FsError::NotFound(from))?;
        files.insert(to, content);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.json", b"hello world").await.unwrap();
        let content = fs.read("test.json").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists("test.json").await.unwrap());
        assert!(!fs.exists("nonexistent.json").await.unwrap());

        fs.delete("test.json").await.unwrap();
        assert!(!fs.exists("test.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_replaces_target() {
        let fs = InMemoryFs::new();
        fs.write("store.json", b"old").await.unwrap();
        fs.write("store.json.tmp", b"new").await.unwrap();

        fs.rename("store.json.tmp", "store.json").await.unwrap();

        assert_eq!(fs.read("store.json").await.unwrap(), b"new");
        assert!(!fs.exists("store.json.tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_writes_leaves_existing_content() {
        let fs = InMemoryFs::new();
        fs.write("store.json", b"committed").await.unwrap();

        fs.set_fail_writes(true);
        assert!(fs.write("store.json", b"lost").await.is_err());

        fs.set_fail_writes(false);
        assert_eq!(fs.read("store.json").await.unwrap(), b"committed");
    }
}

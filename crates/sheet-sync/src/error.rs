use crate::fs::FsError;
use crate::mapper::MapperError;
use crate::remote::RemoteError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Mapping error: {0}")]
    Mapper(#[from] MapperError),

    #[error("Sync is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, SyncError>;

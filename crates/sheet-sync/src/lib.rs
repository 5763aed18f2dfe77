//! sheet-sync: offline-first synchronization between a local sheet store and a
//! remote record database.
//!
//! This crate provides:
//! - Field-level dirty tracking (`FieldMask` over the fixed `FieldKey` enumeration)
//! - A transactional local store with change events (`LocalStore`)
//! - A thin client over the remote record database (`RemoteClient`, `RemoteDatabase`)
//! - Upstream change processors (insert, update, delete) and the downloader
//! - Remote error classification and the `SyncCoordinator` state machine

pub mod classify;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod env;
pub mod error;
pub mod events;
pub mod fields;
pub mod fs;
pub mod mapper;
pub mod model;
pub mod processors;
pub mod remote;
pub mod store;

#[cfg(test)]
mod testing;

pub use classify::{classify, Strategy};
pub use config::SyncConfig;
pub use coordinator::{CycleReport, SyncCoordinator, SyncState};
pub use env::{InFlight, RunGuard, SyncEnv};
pub use error::{Result, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use fields::{FieldKey, FieldMask};
pub use fs::{FileSystem, FsError, InMemoryFs};
pub use mapper::RecordMapper;
pub use model::{ColumnSpec, NewSheet, ObjectId, PendingDeletion, Sheet, SyncStatus};
pub use remote::{
    InMemoryRemote, RecordId, RemoteClient, RemoteDatabase, RemoteError, RemoteRecord, ZoneId,
};
pub use store::{ContextRole, LocalStore, StoreEvent, Transaction};

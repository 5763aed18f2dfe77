//! Upstream change processors.
//!
//! Three processors push local changes: `Inserter` creates records for
//! sheets that were never uploaded, `Updater` sends the dirty fields of
//! uploaded sheets and `Deleter` carries out deletion instructions. Each one
//! repeatedly selects a batch of pending work, claims it in the in-flight
//! set, talks to the remote and commits the outcome in the sync context.
//!
//! Per-item conflicts are absorbed here. Errors that need the coordinator
//! (disable, pause) are returned after every successful item is committed.

mod deleter;
mod inserter;
mod updater;

pub use deleter::Deleter;
pub use inserter::Inserter;
pub use updater::Updater;

use crate::classify::{classify, Strategy};
use crate::env::SyncEnv;
use crate::error::{Result, SyncError};
use crate::model::ObjectId;
use crate::remote::{RecordId, RemoteError, RemoteRecord};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Which objects a push considers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Everything pending
    All,
    /// Only these objects (from a local save); deletion instructions are
    /// always considered in full
    Objects(BTreeSet<ObjectId>),
}

impl Scope {
    pub fn includes(&self, id: ObjectId) -> bool {
        match self {
            Scope::All => true,
            Scope::Objects(ids) => ids.contains(&id),
        }
    }
}

/// Upload batch size of one processor. Only ever shrinks.
#[derive(Debug)]
pub struct BatchSize(AtomicUsize);

impl BatchSize {
    pub fn new(initial: usize) -> Self {
        Self(AtomicUsize::new(initial.max(1)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Halve the size. Returns false if it is already 1.
    pub fn shrink(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                (size > 1).then_some(size / 2)
            })
            .is_ok()
    }
}

/// The closed set of upstream processors.
pub enum UpstreamProcessor {
    Insert(Inserter),
    Update(Updater),
    Delete(Deleter),
}

impl UpstreamProcessor {
    /// Every processor, in the order a push runs them.
    pub fn all(batch_size: usize) -> Vec<Self> {
        vec![
            Self::Insert(Inserter::new(batch_size)),
            Self::Update(Updater::new(batch_size)),
            Self::Delete(Deleter::new(batch_size)),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            Self::Insert(p) => p.batch_size(),
            Self::Update(p) => p.batch_size(),
            Self::Delete(p) => p.batch_size(),
        }
    }

    /// Push everything pending in `scope`. Returns the number of items the
    /// remote accepted.
    pub async fn run(&self, env: &SyncEnv, scope: &Scope) -> Result<usize> {
        match self {
            Self::Insert(p) => p.run(env, scope).await,
            Self::Update(p) => p.run(env, scope).await,
            Self::Delete(p) => p.run(env).await,
        }
    }
}

/// Outcome of one batch that reached the server.
pub(crate) struct BatchResult<T> {
    pub done: Vec<T>,
    pub failures: BTreeMap<RecordId, RemoteError>,
}

/// Normalize a batch call. `Ok(None)` means the batch was too large and the
/// size has been halved; the caller retries with a smaller batch.
pub(crate) fn settle<T>(
    env: &SyncEnv,
    batch: &BatchSize,
    result: std::result::Result<Vec<T>, RemoteError>,
    from_partial: impl FnOnce(Vec<RemoteRecord>) -> Vec<T>,
) -> Result<Option<BatchResult<T>>> {
    match result {
        Ok(done) => Ok(Some(BatchResult {
            done,
            failures: BTreeMap::new(),
        })),
        Err(RemoteError::PartialFailure { failures, saved }) => Ok(Some(BatchResult {
            done: from_partial(saved),
            failures,
        })),
        Err(error) => match classify(&error, env.retry_delay) {
            Strategy::ShrinkBatch if batch.shrink() => {
                warn!("Batch too large, shrinking to {}", batch.get());
                Ok(None)
            }
            _ => Err(error.into()),
        },
    }
}

/// How a processor should treat one failed item.
pub(crate) enum ItemAction {
    /// Leave it pending for a later cycle
    Defer,
    /// The record is gone remotely
    Vanished,
    /// Hand the error to the coordinator
    Escalate(RemoteError),
}

pub(crate) fn item_action(env: &SyncEnv, id: &RecordId, error: RemoteError) -> ItemAction {
    match classify(&error, env.retry_delay) {
        Strategy::Conflict | Strategy::RetryItem => {
            debug!("Deferring {}: {}", id, error);
            ItemAction::Defer
        }
        Strategy::Vanished => ItemAction::Vanished,
        _ => ItemAction::Escalate(error),
    }
}

/// Drop results that arrive after the coordinator stopped.
pub(crate) fn ensure_current(env: &SyncEnv) -> Result<()> {
    if env.guard.is_current() {
        Ok(())
    } else {
        debug!("Dropping results of a stopped run");
        Err(SyncError::NotRunning)
    }
}

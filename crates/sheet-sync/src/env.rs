//! Shared handles and in-memory coordination state of one sync engine.

use crate::config::SyncConfig;
use crate::mapper::RecordMapper;
use crate::model::ObjectId;
use crate::remote::{RecordId, RemoteClient};
use crate::store::LocalStore;

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything a processor needs, passed explicitly instead of living in a
/// global.
#[derive(Clone)]
pub struct SyncEnv {
    pub store: LocalStore,
    pub remote: RemoteClient,
    pub mapper: RecordMapper,
    pub objects_in_flight: InFlight<ObjectId>,
    pub deletions_in_flight: InFlight<RecordId>,
    pub guard: RunGuard,
    pub retry_delay: Duration,
}

impl SyncEnv {
    pub fn new(store: LocalStore, remote: RemoteClient, config: &SyncConfig) -> Self {
        Self {
            store,
            mapper: RecordMapper::new(remote.zone().clone()),
            remote,
            objects_in_flight: InFlight::default(),
            deletions_in_flight: InFlight::default(),
            guard: RunGuard::detached(),
            retry_delay: config.retry_delay(),
        }
    }
}

/// Set of keys currently owned by some processor.
#[derive(Debug)]
pub struct InFlight<K> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K> Clone for InFlight<K> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
        }
    }
}

impl<K> Default for InFlight<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    /// Claim every key not already claimed. The claim ends when the
    /// returned guard is dropped.
    pub fn claim(&self, candidates: impl IntoIterator<Item = K>) -> Claim<K> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let claimed = candidates
            .into_iter()
            .filter(|key| keys.insert(key.clone()))
            .collect();
        Claim {
            owner: self.clone(),
            keys: claimed,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys owned by one processor run.
pub struct Claim<K: Eq + Hash + Clone> {
    owner: InFlight<K>,
    keys: Vec<K>,
}

impl<K: Eq + Hash + Clone> Claim<K> {
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Drop for Claim<K> {
    fn drop(&mut self) {
        let mut keys = self.owner.keys.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            keys.remove(key);
        }
    }
}

/// Detects that the coordinator stopped (or restarted) while a network call
/// was outstanding.
#[derive(Debug, Clone)]
pub struct RunGuard {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl RunGuard {
    /// Guard that stays valid until `invalidate` is called on it.
    pub fn detached() -> Self {
        Self {
            generation: 0,
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Guard for the next run; every guard issued before becomes stale.
    pub fn next(&self) -> Self {
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            generation,
            current: Arc::clone(&self.current),
        }
    }

    /// Make this guard and every guard of the same run stale.
    pub fn invalidate(&self) {
        let _ = self.current.compare_exchange(
            self.generation,
            self.generation + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

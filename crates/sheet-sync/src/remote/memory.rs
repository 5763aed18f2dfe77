//! In-memory remote record database.
//!
//! Behaves like a cloud record store closely enough to exercise every sync
//! path: server change tags with if-unchanged saves, a paged change feed with
//! expiring continuation tokens, non-atomic batches with per-item failures,
//! a maximum batch size, server-side canonicalization and push notifications
//! for subscribed zones. Tests steer it through one-shot fault injection and
//! a save gate that holds an upload mid-flight.

use super::{
    ChangeToken, ChangesPage, RecordId, RecordMetadata, RemoteDatabase, RemoteError,
    RemoteRecord, Result, ZoneId,
};
use crate::model::now_millis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use tracing::debug;

/// Operations that can have failures injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Zones,
    Fetch,
    Save,
    Delete,
    Lookup,
}

/// Serializable state of the whole database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteState {
    zones: Vec<ZoneState>,
    subscriptions: BTreeMap<String, ZoneId>,
    next_change_tag: u64,
}

impl RemoteState {
    fn zone(&self, zone: &ZoneId) -> Option<&ZoneState> {
        self.zones.iter().find(|z| &z.zone == zone)
    }

    fn zone_mut(&mut self, zone: &ZoneId) -> Option<&mut ZoneState> {
        self.zones.iter_mut().find(|z| &z.zone == zone)
    }

    fn is_subscribed(&self, zone: &ZoneId) -> bool {
        self.subscriptions.values().any(|z| z == zone)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ZoneState {
    zone: ZoneId,
    /// Bumped to invalidate every outstanding change token
    epoch: u64,
    /// Sequence number of the last change
    seq: u64,
    records: BTreeMap<String, RemoteRecord>,
    log: Vec<LogEntry>,
}

impl ZoneState {
    fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            epoch: 0,
            seq: 0,
            records: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    fn append(&mut self, name: &str, deleted: bool) {
        self.seq += 1;
        self.log.push(LogEntry {
            seq: self.seq,
            name: name.to_string(),
            deleted,
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    seq: u64,
    name: String,
    deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    epoch: u64,
    seq: u64,
}

type Canonicalizer = Arc<dyn Fn(&mut RemoteRecord) + Send + Sync>;

/// Handle for an upload held at the server until released.
#[derive(Clone)]
pub struct SaveHold {
    arrived: Arc<Notify>,
    release: Arc<Notify>,
}

impl SaveHold {
    /// Wait until an upload reached the server and is being held.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    /// Let the held upload complete.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Simulated remote record database.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    failures: Mutex<HashMap<RemoteOp, VecDeque<RemoteError>>>,
    max_batch_size: Mutex<Option<usize>>,
    canonicalizer: Mutex<Option<Canonicalizer>>,
    hold: Mutex<Option<SaveHold>>,
    notifications: broadcast::Sender<ZoneId>,
    save_batches: Mutex<Vec<usize>>,
    fetch_tokens: Mutex<Vec<Option<ChangeToken>>>,
    fetch_calls: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::from_state(RemoteState::default())
    }

    /// Restore a database from exported state.
    pub fn from_state(state: RemoteState) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(state),
            failures: Mutex::new(HashMap::new()),
            max_batch_size: Mutex::new(None),
            canonicalizer: Mutex::new(None),
            hold: Mutex::new(None),
            notifications,
            save_batches: Mutex::new(Vec::new()),
            fetch_tokens: Mutex::new(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the whole database.
    pub fn export_state(&self) -> RemoteState {
        self.lock_state().clone()
    }

    /// Replace the whole database (used when another process wrote it).
    pub fn replace_state(&self, state: RemoteState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Test controls ====================

    /// Fail the next call of `op` with `error`. Queued failures fire in order.
    pub fn inject_failure(&self, op: RemoteOp, error: RemoteError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Reject save and delete batches larger than `limit`.
    pub fn set_max_batch_size(&self, limit: Option<usize>) {
        *self.max_batch_size.lock().unwrap_or_else(|e| e.into_inner()) = limit;
    }

    /// Rewrite every saved record before storing it, like a server that
    /// normalizes values.
    pub fn set_canonicalizer(&self, f: impl Fn(&mut RemoteRecord) + Send + Sync + 'static) {
        *self.canonicalizer.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(f));
    }

    /// Hold the next save at the server until the returned handle releases it.
    pub fn hold_next_save(&self) -> SaveHold {
        let hold = SaveHold {
            arrived: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        *self.hold.lock().unwrap_or_else(|e| e.into_inner()) = Some(hold.clone());
        hold
    }

    /// Invalidate every change token issued for `zone`.
    pub fn expire_change_tokens(&self, zone: &ZoneId) {
        if let Some(state) = self.lock_state().zone_mut(zone) {
            state.epoch += 1;
        }
    }

    /// Push notifications for subscribed zones.
    pub fn notifications(&self) -> broadcast::Receiver<ZoneId> {
        self.notifications.subscribe()
    }

    /// Write a record as another device would, bypassing change-tag checks.
    pub fn force_put(&self, mut record: RemoteRecord) -> RemoteRecord {
        let mut state = self.lock_state();
        let tag = Self::next_tag(&mut state);
        if state.zone(&record.id.zone).is_none() {
            state.zones.push(ZoneState::new(record.id.zone.clone()));
        }
        record.metadata = Some(RecordMetadata {
            change_tag: tag,
            modified_at: now_millis(),
        });
        if let Some(zone) = state.zone_mut(&record.id.zone) {
            zone.records.insert(record.id.name.clone(), record.clone());
            zone.append(&record.id.name, false);
        }
        let notify = state.is_subscribed(&record.id.zone);
        drop(state);
        if notify {
            let _ = self.notifications.send(record.id.zone.clone());
        }
        record
    }

    /// Delete a record as another device would.
    pub fn force_delete(&self, id: &RecordId) -> bool {
        let mut state = self.lock_state();
        let removed = match state.zone_mut(&id.zone) {
            Some(zone) => {
                let removed = zone.records.remove(&id.name).is_some();
                if removed {
                    zone.append(&id.name, true);
                }
                removed
            }
            None => false,
        };
        let notify = removed && state.is_subscribed(&id.zone);
        drop(state);
        if notify {
            let _ = self.notifications.send(id.zone.clone());
        }
        removed
    }

    /// Current server copy of a record.
    pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        self.lock_state()
            .zone(&id.zone)
            .and_then(|zone| zone.records.get(&id.name).cloned())
    }

    /// All records of a zone, ordered by name.
    pub fn records(&self, zone: &ZoneId) -> Vec<RemoteRecord> {
        self.lock_state()
            .zone(zone)
            .map(|z| z.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.lock_state().zone(zone).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock_state().subscriptions.len()
    }

    /// Sizes of every save batch received (including rejected ones).
    pub fn save_batch_sizes(&self) -> Vec<usize> {
        self.save_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Token passed to every change-feed request, in order.
    pub fn fetch_tokens(&self) -> Vec<Option<ChangeToken>> {
        self.fetch_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    // ==================== Internals ====================

    fn take_failure(&self, op: RemoteOp) -> Result<()> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check_batch_size(&self, len: usize) -> Result<()> {
        let limit = *self.max_batch_size.lock().unwrap_or_else(|e| e.into_inner());
        match limit {
            Some(limit) if len > limit => Err(RemoteError::LimitExceeded),
            _ => Ok(()),
        }
    }

    fn next_tag(state: &mut RemoteState) -> u64 {
        state.next_change_tag += 1;
        state.next_change_tag
    }

    fn encode_token(epoch: u64, seq: u64) -> Result<ChangeToken> {
        bincode::serialize(&TokenPayload { epoch, seq })
            .map(ChangeToken::from_bytes)
            .map_err(|e| RemoteError::Unknown(e.to_string()))
    }

    fn save_one(
        state: &mut RemoteState,
        mut incoming: RemoteRecord,
        canonicalizer: Option<&Canonicalizer>,
    ) -> Result<RemoteRecord> {
        let tag = Self::next_tag(state);
        let zone = state
            .zone_mut(&incoming.id.zone)
            .ok_or(RemoteError::ZoneNotFound)?;
        let existing = zone.records.get(&incoming.id.name).cloned();
        let sent_tag = incoming.metadata.take().map(|m| m.change_tag);

        let mut merged = match (existing, sent_tag) {
            (None, None) => incoming,
            (None, Some(_)) => return Err(RemoteError::UnknownItem),
            (Some(_), None) => return Err(RemoteError::ServerRecordChanged),
            (Some(mut current), Some(sent)) => {
                if current.metadata.as_ref().map(|m| m.change_tag) != Some(sent) {
                    return Err(RemoteError::ServerRecordChanged);
                }
                current.fields.extend(incoming.fields);
                current
            }
        };

        if let Some(canonicalize) = canonicalizer {
            canonicalize(&mut merged);
        }
        merged.metadata = Some(RecordMetadata {
            change_tag: tag,
            modified_at: now_millis(),
        });
        zone.records.insert(merged.id.name.clone(), merged.clone());
        zone.append(&merged.id.name, false);
        Ok(merged)
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteDatabase for InMemoryRemote {
    async fn fetch_zones(&self) -> Result<Vec<ZoneId>> {
        self.take_failure(RemoteOp::Zones)?;
        Ok(self.lock_state().zones.iter().map(|z| z.zone.clone()).collect())
    }

    async fn save_zone(&self, zone: &ZoneId) -> Result<()> {
        self.take_failure(RemoteOp::Zones)?;
        let mut state = self.lock_state();
        if state.zone(zone).is_none() {
            debug!("Creating zone {}", zone);
            state.zones.push(ZoneState::new(zone.clone()));
        }
        Ok(())
    }

    async fn fetch_subscriptions(&self) -> Result<Vec<String>> {
        self.take_failure(RemoteOp::Zones)?;
        Ok(self.lock_state().subscriptions.keys().cloned().collect())
    }

    async fn save_subscription(&self, id: &str, zone: &ZoneId) -> Result<()> {
        self.take_failure(RemoteOp::Zones)?;
        self.lock_state()
            .subscriptions
            .insert(id.to_string(), zone.clone());
        Ok(())
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        since: Option<&ChangeToken>,
        limit: usize,
    ) -> Result<ChangesPage> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(since.cloned());
        self.take_failure(RemoteOp::Fetch)?;

        let state = self.lock_state();
        let zone_state = state.zone(zone).ok_or(RemoteError::ZoneNotFound)?;

        let since_seq = match since {
            None => 0,
            Some(token) => {
                let payload: TokenPayload = bincode::deserialize(token.as_bytes())
                    .map_err(|_| RemoteError::ChangeTokenExpired)?;
                if payload.epoch != zone_state.epoch || payload.seq > zone_state.seq {
                    return Err(RemoteError::ChangeTokenExpired);
                }
                payload.seq
            }
        };

        // Latest entry per record name after `since_seq`, in feed order.
        let mut latest: BTreeMap<&str, &LogEntry> = BTreeMap::new();
        for entry in zone_state.log.iter().filter(|e| e.seq > since_seq) {
            latest.insert(entry.name.as_str(), entry);
        }
        let mut entries: Vec<&LogEntry> = latest.into_values().collect();
        entries.sort_by_key(|e| e.seq);

        let more_coming = entries.len() > limit.max(1);
        entries.truncate(limit.max(1));
        let page_seq = match entries.last() {
            Some(last) if more_coming => last.seq,
            _ => zone_state.seq,
        };

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for entry in entries {
            match zone_state.records.get(&entry.name) {
                Some(record) if !entry.deleted => changed.push(record.clone()),
                _ => deleted.push(RecordId::new(zone.clone(), entry.name.clone())),
            }
        }

        Ok(ChangesPage {
            changed,
            deleted,
            token: Self::encode_token(zone_state.epoch, page_seq)?,
            more_coming,
        })
    }

    async fn save_records(&self, records: Vec<RemoteRecord>) -> Result<Vec<RemoteRecord>> {
        self.save_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(records.len());
        self.take_failure(RemoteOp::Save)?;
        self.check_batch_size(records.len())?;

        let hold = self.hold.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(hold) = hold {
            hold.arrived.notify_one();
            hold.release.notified().await;
        }

        let canonicalizer = self
            .canonicalizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut state = self.lock_state();
        let mut saved = Vec::new();
        let mut failures = BTreeMap::new();
        for record in records {
            let id = record.id.clone();
            match Self::save_one(&mut state, record, canonicalizer.as_ref()) {
                Ok(record) => saved.push(record),
                Err(error) => {
                    failures.insert(id, error);
                }
            }
        }

        let notify: Vec<ZoneId> = state
            .zones
            .iter()
            .map(|z| z.zone.clone())
            .filter(|zone| {
                state.is_subscribed(zone) && saved.iter().any(|r| &r.id.zone == zone)
            })
            .collect();
        drop(state);
        for zone in notify {
            let _ = self.notifications.send(zone);
        }

        if failures.is_empty() {
            Ok(saved)
        } else {
            Err(RemoteError::PartialFailure { failures, saved })
        }
    }

    async fn fetch_records(&self, ids: Vec<RecordId>) -> Result<Vec<RemoteRecord>> {
        self.take_failure(RemoteOp::Lookup)?;
        let state = self.lock_state();
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .zone(&id.zone)
                    .and_then(|zone| zone.records.get(&id.name).cloned())
            })
            .collect())
    }

    async fn delete_records(&self, ids: Vec<RecordId>) -> Result<Vec<RecordId>> {
        self.take_failure(RemoteOp::Delete)?;
        self.check_batch_size(ids.len())?;

        let mut state = self.lock_state();
        let mut deleted = Vec::new();
        let mut failures = BTreeMap::new();
        for id in ids {
            match state.zone_mut(&id.zone) {
                None => {
                    failures.insert(id, RemoteError::ZoneNotFound);
                }
                Some(zone) => {
                    if zone.records.remove(&id.name).is_some() {
                        zone.append(&id.name, true);
                        deleted.push(id);
                    } else {
                        failures.insert(id, RemoteError::UnknownItem);
                    }
                }
            }
        }
        drop(state);

        if failures.is_empty() {
            Ok(deleted)
        } else {
            Err(RemoteError::PartialFailure {
                failures,
                saved: Vec::new(),
            })
        }
    }
}

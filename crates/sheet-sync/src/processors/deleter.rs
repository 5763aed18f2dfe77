use super::{ensure_current, item_action, settle, BatchSize, ItemAction};
use crate::env::SyncEnv;
use crate::error::{Result, SyncError};
use crate::model::PendingDeletion;
use crate::remote::{RecordId, RemoteError};
use crate::store::ContextRole;

use std::collections::HashSet;
use tracing::info;

/// Carries out deletion instructions left by local deletes.
pub struct Deleter {
    batch: BatchSize,
}

impl Deleter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch: BatchSize::new(batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch.get()
    }

    /// Deletion instructions nobody else is working on.
    pub async fn select_pending(
        &self,
        env: &SyncEnv,
        skip: &HashSet<RecordId>,
        limit: usize,
    ) -> Vec<PendingDeletion> {
        // Over-fetch: skipped and in-flight entries would otherwise starve
        // the rest of the queue.
        let window = limit.saturating_add(skip.len() + env.deletions_in_flight.len());
        env.store
            .pending_deletions(window)
            .await
            .into_iter()
            .filter(|p| !skip.contains(&p.record) && !env.deletions_in_flight.contains(&p.record))
            .take(limit)
            .collect()
    }

    pub(super) async fn run(&self, env: &SyncEnv) -> Result<usize> {
        let mut attempted = HashSet::new();
        let mut deleted = 0;

        loop {
            let pending = self
                .select_pending(env, &attempted, self.batch.get())
                .await;
            if pending.is_empty() {
                return Ok(deleted);
            }

            let claim = env
                .deletions_in_flight
                .claim(pending.into_iter().map(|p| p.record));
            let ids = claim.keys().to_vec();
            attempted.extend(ids.iter().cloned());

            match self.process(env, ids.clone()).await? {
                Some(count) => deleted += count,
                None => {
                    for id in &ids {
                        attempted.remove(id);
                    }
                }
            }
            drop(claim);
        }
    }

    async fn process(&self, env: &SyncEnv, ids: Vec<RecordId>) -> Result<Option<usize>> {
        if ids.is_empty() {
            return Ok(Some(0));
        }

        let result = env.remote.delete(ids.clone()).await.map(|()| ids.clone());
        let Some(outcome) = settle(env, &self.batch, result, |_| Vec::new())? else {
            return Ok(None);
        };
        ensure_current(env)?;

        let mut resolved: Vec<RecordId> = ids
            .iter()
            .filter(|id| !outcome.failures.contains_key(id))
            .cloned()
            .collect();
        let mut escalate: Option<RemoteError> = None;
        for (id, error) in outcome.failures {
            match item_action(env, &id, error) {
                // Already gone remotely is as good as deleted.
                ItemAction::Vanished => resolved.push(id),
                ItemAction::Defer => {}
                ItemAction::Escalate(error) => {
                    escalate.get_or_insert(error);
                }
            }
        }

        let count = resolved.len();
        env.store
            .transaction(ContextRole::Sync, |tx| -> Result<()> {
                for id in &resolved {
                    tx.remove_pending_deletion(id);
                }
                Ok(())
            })
            .await?;

        if count > 0 {
            info!("Deleted {} record(s)", count);
        }
        match escalate {
            Some(error) => Err(SyncError::Remote(error)),
            None => Ok(Some(count)),
        }
    }
}

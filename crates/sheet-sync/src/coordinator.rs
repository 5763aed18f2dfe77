//! Sync coordinator: lifecycle, scheduling and failure policy.
//!
//! ```text
//!            start()                      disable
//!  Stopped ──────────▶ Running ───────────────────▶ Stopped (+ SyncDisabled)
//!     ▲                 │   ▲
//!     │ stop()          │   │ start() after backoff
//!     └─────────────────┤   │
//!                       ▼   │
//!                      Paused (+ SyncPaused)
//! ```
//!
//! While running, an observer task watches local commits and offers the
//! changed objects to the upstream processors. Pulls and pushes never
//! overlap: every cycle holds the cycle lock.

use crate::classify::{classify, Strategy};
use crate::config::SyncConfig;
use crate::downloader::{Downloader, PullOutcome};
use crate::env::{RunGuard, SyncEnv};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::model::SyncStatus;
use crate::processors::{Scope, UpstreamProcessor};
use crate::remote::{RemoteClient, RemoteDatabase, RemoteError, ZoneId};
use crate::store::{ContextRole, LocalStore, StoreEvent};

use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Stopped,
    Running,
    Paused,
}

/// Work done by one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Remote changes and deletions applied locally
    pub pulled: usize,
    /// Local inserts, updates and deletions accepted remotely
    pub pushed: usize,
}

/// State of one running period, between a start and the next stop.
struct Run {
    env: SyncEnv,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    env: SyncEnv,
    processors: Vec<UpstreamProcessor>,
    downloader: Downloader,
    events: Arc<EventBus>,
    state: watch::Sender<SyncState>,
    run: Mutex<Option<Run>>,
    cycle: tokio::sync::Mutex<()>,
    /// Bumped by every start and stop; a scheduled restart only fires if
    /// nothing happened since it was scheduled
    epoch: AtomicU64,
}

/// Shared handle to the sync engine.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(store: LocalStore, database: Arc<dyn RemoteDatabase>, config: &SyncConfig) -> Self {
        let remote = RemoteClient::new(database, config);
        let (state, _) = watch::channel(SyncState::Stopped);
        Self {
            inner: Arc::new(Inner {
                env: SyncEnv::new(store, remote, config),
                processors: UpstreamProcessor::all(config.batch_size),
                downloader: Downloader::new(),
                events: Arc::new(EventBus::new()),
                state,
                run: Mutex::new(None),
                cycle: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.env.store
    }

    pub fn zone(&self) -> &ZoneId {
        self.inner.env.remote.zone()
    }

    /// Current batch size of each processor, by name.
    pub fn batch_sizes(&self) -> Vec<(&'static str, usize)> {
        self.inner
            .processors
            .iter()
            .map(|p| (p.name(), p.batch_size()))
            .collect()
    }

    // ==================== Lifecycle ====================

    /// Start syncing and run one full cycle (pull, then push).
    ///
    /// Also the explicit re-enable after a disable. Returns `None` if sync
    /// was already running.
    pub async fn start(&self) -> Result<Option<CycleReport>> {
        if let SyncStatus::Disabled { reason } = self.store().sync_status().await {
            info!("Re-enabling sync (was disabled: {})", reason);
            self.store()
                .transaction(ContextRole::Sync, |tx| -> Result<()> {
                    tx.set_sync_status(SyncStatus::Enabled);
                    Ok(())
                })
                .await?;
        }

        let env = {
            let mut run = self.inner.run.lock().unwrap_or_else(|e| e.into_inner());
            if run.is_some() {
                return Ok(None);
            }
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);

            let env = SyncEnv {
                guard: self.inner.env.guard.next(),
                ..self.inner.env.clone()
            };
            let (shutdown, shutdown_rx) = watch::channel(false);
            tokio::spawn(observe_local_changes(
                Arc::downgrade(&self.inner),
                env.clone(),
                self.store().subscribe(),
                shutdown_rx,
            ));
            *run = Some(Run {
                env: env.clone(),
                shutdown,
            });
            env
        };
        self.inner.state.send_replace(SyncState::Running);
        info!("Sync started for {}", self.zone());

        self.cycle(&env, true, Some(Scope::All)).await.map(Some)
    }

    /// Stop syncing. In-flight calls finish, but their results are dropped.
    pub fn stop(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if self.end_run() || self.state() != SyncState::Stopped {
            info!("Sync stopped");
        }
        self.inner.state.send_replace(SyncState::Stopped);
    }

    /// Tear down the current run. Returns whether there was one.
    fn end_run(&self) -> bool {
        let run = self
            .inner
            .run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match run {
            Some(run) => {
                run.env.guard.invalidate();
                run.shutdown.send_replace(true);
                true
            }
            None => false,
        }
    }

    fn current_env(&self) -> Option<SyncEnv> {
        self.inner
            .run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|run| run.env.clone())
    }

    // ==================== Cycles ====================

    /// Pull, then push everything pending. `None` when not running.
    pub async fn process_pending_changes(&self) -> Result<Option<CycleReport>> {
        let Some(env) = self.current_env() else {
            return Ok(None);
        };
        self.cycle(&env, true, Some(Scope::All)).await.map(Some)
    }

    /// Pull only; called when the remote reports a change.
    pub async fn on_remote_notification(&self) -> Result<Option<CycleReport>> {
        let Some(env) = self.current_env() else {
            return Ok(None);
        };
        self.cycle(&env, false, None).await.map(Some)
    }

    /// Forward push notifications for this zone to `on_remote_notification`
    /// until the sender goes away.
    pub fn watch_remote_notifications(&self, mut notifications: broadcast::Receiver<ZoneId>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let zone = self.zone().clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(changed) if changed != zone => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let coordinator = SyncCoordinator { inner };
                if let Err(e) = coordinator.on_remote_notification().await {
                    debug!("Pull after notification failed: {}", e);
                }
            }
        })
    }

    async fn cycle(&self, env: &SyncEnv, pull: bool, push: Option<Scope>) -> Result<CycleReport> {
        let result = self.run_cycle(env, pull, push).await;
        match &result {
            Ok(report) => {
                if report.pulled + report.pushed > 0 {
                    debug!("Cycle done: pulled {}, pushed {}", report.pulled, report.pushed);
                }
                self.inner.events.emit(SyncEvent::CycleCompleted {
                    pulled: report.pulled,
                    pushed: report.pushed,
                });
            }
            Err(e) => self.fail(&env.guard, e).await,
        }
        result
    }

    async fn run_cycle(&self, env: &SyncEnv, pull: bool, push: Option<Scope>) -> Result<CycleReport> {
        let _cycle = self.inner.cycle.lock().await;
        if !env.guard.is_current() {
            return Err(SyncError::NotRunning);
        }

        env.remote.ensure_zone_and_subscription().await?;

        let mut report = CycleReport::default();
        if pull {
            report.pulled = self.pull(env).await?;
        }
        if let Some(scope) = push {
            for processor in &self.inner.processors {
                report.pushed += processor.run(env, &scope).await?;
            }
        }
        Ok(report)
    }

    async fn pull(&self, env: &SyncEnv) -> Result<usize> {
        // An expired token is dropped by the downloader; the second attempt
        // is a full fetch.
        for _ in 0..2 {
            match self.inner.downloader.process_remote_changes(env).await? {
                PullOutcome::Applied { changed, deleted } => return Ok(changed + deleted),
                PullOutcome::TokenReset => continue,
            }
        }
        Err(RemoteError::ChangeTokenExpired.into())
    }

    /// Push the objects of one local commit.
    async fn push_local_changes(&self, env: &SyncEnv, event: StoreEvent) {
        let ids: BTreeSet<_> = event
            .inserted
            .iter()
            .chain(event.updated.iter())
            .copied()
            .collect();
        debug!(
            "Local commit: {} changed, {} deleted",
            ids.len(),
            event.deleted.len()
        );
        if let Err(e) = self.cycle(env, false, Some(Scope::Objects(ids))).await {
            debug!("Push after local commit failed: {}", e);
        }
    }

    // ==================== Failure policy ====================

    async fn fail(&self, guard: &RunGuard, error: &SyncError) {
        if !guard.is_current() {
            debug!("Ignoring failure of a stopped run: {}", error);
            return;
        }
        let retry = self.inner.env.retry_delay;
        match error {
            SyncError::NotRunning => {}
            SyncError::Remote(remote) => match classify(remote, retry) {
                Strategy::Disable(reason) => self.disable(reason).await,
                Strategy::RetryAfter(delay) => self.pause(delay),
                other => {
                    warn!("Unresolved {:?} after {}; pausing", other, remote);
                    self.pause(retry);
                }
            },
            // Local failures are never retried blindly.
            other => self.disable(other.to_string()).await,
        }
    }

    async fn disable(&self, reason: String) {
        error!("Disabling sync: {}", reason);
        self.stop();
        let status = SyncStatus::Disabled {
            reason: reason.clone(),
        };
        let saved = self
            .store()
            .transaction(ContextRole::Sync, |tx| -> Result<()> {
                tx.set_sync_status(status);
                Ok(())
            })
            .await;
        if let Err(e) = saved {
            error!("Could not persist disabled state: {}", e);
        }
        self.inner.events.emit(SyncEvent::SyncDisabled { reason });
    }

    fn pause(&self, delay: Duration) {
        warn!("Pausing sync for {:?}", delay);
        self.end_run();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.send_replace(SyncState::Paused);
        self.inner.events.emit(SyncEvent::SyncPaused {
            retry_after_secs: delay.as_secs(),
        });
        tokio::spawn(restart_after(Arc::downgrade(&self.inner), delay, epoch));
    }
}

/// Restart a paused coordinator once `delay` has passed, unless it was
/// started or stopped in the meantime.
fn restart_after(inner: Weak<Inner>, delay: Duration, epoch: u64) -> BoxFuture<'static, ()> {
    async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let coordinator = SyncCoordinator { inner };
        if coordinator.state() != SyncState::Paused
            || coordinator.inner.epoch.load(Ordering::SeqCst) != epoch
        {
            return;
        }
        info!("Resuming sync after pause");
        if let Err(e) = coordinator.start().await {
            debug!("Restart failed: {}", e);
        }
    }
    .boxed()
}

/// Offer every interactive commit to the upstream processors until shutdown.
async fn observe_local_changes(
    inner: Weak<Inner>,
    env: SyncEnv,
    mut commits: broadcast::Receiver<StoreEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            commit = commits.recv() => match commit {
                Ok(event) if event.origin == ContextRole::Interactive && !event.is_empty() => event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} local commit(s); pushing everything", missed);
                    StoreEvent {
                        origin: ContextRole::Interactive,
                        inserted: Vec::new(),
                        updated: Vec::new(),
                        deleted: Vec::new(),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if *shutdown.borrow() {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let coordinator = SyncCoordinator { inner };
        if event.is_empty() {
            if let Err(e) = coordinator.cycle(&env, false, Some(Scope::All)).await {
                debug!("Push after missed commits failed: {}", e);
            }
        } else {
            coordinator.push_local_changes(&env, event).await;
        }
    }
    debug!("Local change observer stopped");
}

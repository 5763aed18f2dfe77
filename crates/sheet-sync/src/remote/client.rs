//! Thin client over a `RemoteDatabase`, bound to the sheets zone.

use super::{ChangeToken, RecordId, RemoteDatabase, RemoteError, RemoteRecord, Result, ZoneId};
use crate::config::SyncConfig;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Receives the change feed as it streams in.
pub trait ChangeSink {
    fn record_changed(&mut self, record: RemoteRecord);

    fn record_deleted(&mut self, id: RecordId);

    /// A new resume point. Only valid once every change delivered before it
    /// is applied.
    fn token_updated(&mut self, token: ChangeToken);
}

/// Remote database handle used by the processors and the downloader.
#[derive(Clone)]
pub struct RemoteClient {
    db: Arc<dyn RemoteDatabase>,
    zone: ZoneId,
    subscription_id: String,
    page_size: usize,
    /// Zone and subscription confirmed to exist
    ensured: Arc<AtomicBool>,
}

impl RemoteClient {
    pub fn new(db: Arc<dyn RemoteDatabase>, config: &SyncConfig) -> Self {
        Self {
            db,
            zone: config.zone(),
            subscription_id: config.subscription_id.clone(),
            page_size: config.fetch_page_size.max(1),
            ensured: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    /// Create the zone and its push subscription if either is missing.
    pub async fn ensure_zone_and_subscription(&self) -> Result<()> {
        if self.ensured.load(Ordering::SeqCst) {
            return Ok(());
        }

        let zones = self.observe(self.db.fetch_zones().await)?;
        if !zones.contains(&self.zone) {
            info!("Creating remote zone {}", self.zone);
            self.observe(self.db.save_zone(&self.zone).await)?;
        }

        let subscriptions = self.observe(self.db.fetch_subscriptions().await)?;
        if !subscriptions.contains(&self.subscription_id) {
            info!("Subscribing to changes of {}", self.zone);
            self.observe(
                self.db
                    .save_subscription(&self.subscription_id, &self.zone)
                    .await,
            )?;
        }

        self.ensured.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stream every change since `token` into `sink`, page by page.
    ///
    /// Returns whether anything changed.
    pub async fn fetch_changes(
        &self,
        token: Option<ChangeToken>,
        sink: &mut (dyn ChangeSink + Send),
    ) -> Result<bool> {
        let mut token = token;
        let mut has_changes = false;

        loop {
            let page = self.observe(
                self.db
                    .fetch_zone_changes(&self.zone, token.as_ref(), self.page_size)
                    .await,
            )?;
            debug!(
                "Fetched page: {} changed, {} deleted, more_coming={}",
                page.changed.len(),
                page.deleted.len(),
                page.more_coming
            );

            has_changes |= !page.changed.is_empty() || !page.deleted.is_empty();
            for record in page.changed {
                sink.record_changed(record);
            }
            for id in page.deleted {
                sink.record_deleted(id);
            }
            sink.token_updated(page.token.clone());

            if !page.more_coming {
                return Ok(has_changes);
            }
            token = Some(page.token);
        }
    }

    /// Save a batch. Returns the server's canonical copies.
    pub async fn upload(&self, records: Vec<RemoteRecord>) -> Result<Vec<RemoteRecord>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.observe(self.db.save_records(records).await)
    }

    /// Server copies of the given records; missing ones are left out.
    pub async fn fetch_records(&self, ids: Vec<RecordId>) -> Result<Vec<RemoteRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.observe(self.db.fetch_records(ids).await)
    }

    /// Delete a batch.
    pub async fn delete(&self, ids: Vec<RecordId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.observe(self.db.delete_records(ids).await).map(|_| ())
    }

    /// Forget the ensured zone once the server says it is gone.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(RemoteError::ZoneNotFound | RemoteError::UserDeletedZone) = &result {
            self.ensured.store(false, Ordering::SeqCst);
        }
        result
    }
}

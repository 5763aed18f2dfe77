//! Shared fixtures for unit tests.

use crate::config::SyncConfig;
use crate::env::SyncEnv;
use crate::fs::InMemoryFs;
use crate::model::{NewSheet, ObjectId, Sheet};
use crate::remote::{InMemoryRemote, RemoteClient, RemoteRecord};
use crate::store::{ContextRole, LocalStore, StoreError};

use std::sync::Arc;

/// One device: a store on an in-memory fs, talking to a shared remote.
pub struct Harness {
    pub fs: Arc<InMemoryFs>,
    pub remote: Arc<InMemoryRemote>,
    pub store: LocalStore,
    pub env: SyncEnv,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(SyncConfig::default()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        Self::device(Arc::new(InMemoryRemote::new()), config).await
    }

    /// Another device sharing `remote`.
    pub async fn device(remote: Arc<InMemoryRemote>, config: SyncConfig) -> Self {
        let fs = Arc::new(InMemoryFs::new());
        let store = LocalStore::open(fs.clone(), "store.json", config.zone())
            .await
            .unwrap();
        let client = RemoteClient::new(remote.clone(), &config);
        client.ensure_zone_and_subscription().await.unwrap();
        let env = SyncEnv::new(store.clone(), client, &config);
        Self {
            fs,
            remote,
            store,
            env,
        }
    }

    pub async fn add(&self, name: &str) -> ObjectId {
        self.store
            .transaction(ContextRole::Interactive, |tx| {
                tx.insert_sheet(NewSheet::named(name))
            })
            .await
            .unwrap()
    }

    pub async fn edit(&self, id: ObjectId, f: impl FnOnce(&mut Sheet)) {
        self.store
            .transaction(ContextRole::Interactive, |tx| -> Result<(), StoreError> {
                if let Some(sheet) = tx.sheet_mut(id) {
                    f(sheet);
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    pub async fn delete(&self, id: ObjectId) {
        self.store
            .transaction(ContextRole::Interactive, |tx| -> Result<(), StoreError> {
                tx.delete_sheet(id);
                Ok(())
            })
            .await
            .unwrap();
    }

    pub async fn sheet(&self, id: ObjectId) -> Sheet {
        self.store.sheet(id).await.unwrap()
    }

    /// Server copy of a sheet's record.
    pub async fn remote_copy(&self, id: ObjectId) -> RemoteRecord {
        let sheet = self.sheet(id).await;
        self.remote
            .record(&self.env.mapper.record_id(&sheet))
            .unwrap()
    }
}

//! The management boundary: one orchestrator object owning the record
//! store and the supervisor. Constructed once at host startup; collaborators
//! (dashboard, command handlers) only ever talk to this.

use std::path::{Path, PathBuf};

use aviary_instance::{InstanceConfig, InstanceId, InstanceUpdate, NewInstance};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;

use crate::config_store::{ConfigStore, StoredInstance};
use crate::error::HostError;
use crate::supervisor::Supervisor;

/// The observable record of an instance: its config, whether a worker is
/// live right now, and the manifest it is persisted in.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    #[serde(flatten)]
    pub config: InstanceConfig,
    pub running: bool,
    pub file_name: String,
}

/// Redacted platform-wide listing entry. Credentials and instructions never
/// leave the owner surface.
#[derive(Debug, Clone, Serialize)]
pub struct PublicInstance {
    pub id: InstanceId,
    pub display_name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

fn default_worker_bin() -> PathBuf {
    if let Ok(p) = std::env::var("AVIARY_WORKER_BIN") {
        return PathBuf::from(p);
    }
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("aviary-worker")))
        .unwrap_or_else(|| PathBuf::from("aviary-worker"))
}

#[derive(Debug)]
pub struct Manager {
    store: ConfigStore,
    supervisor: Supervisor,
    worker_bin: PathBuf,
    data_root: PathBuf,
}

impl Manager {
    /// Open (or initialize) the data root and construct the orchestrator.
    pub async fn open(data_root: impl Into<PathBuf>) -> Result<Self, HostError> {
        let data_root = data_root.into();
        let store = ConfigStore::open(&data_root).await?;
        Ok(Self {
            store,
            supervisor: Supervisor::default(),
            worker_bin: default_worker_bin(),
            data_root,
        })
    }

    /// Override the worker executable (tests, packaging).
    pub fn with_worker_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.worker_bin = bin.into();
        self
    }

    pub async fn create_instance(
        &self,
        new: NewInstance,
        owner_id: &str,
    ) -> Result<InstanceRecord, HostError> {
        let config = new.into_config(owner_id)?;
        let file_name = self.store.insert(&config).await?;
        tracing::info!(instance = %config.id, owner = %owner_id, "instance created");
        self.record(StoredInstance { config, file_name }).await
    }

    pub async fn list_instances(&self, owner_id: &str) -> Result<Vec<InstanceRecord>, HostError> {
        let mut out = Vec::new();
        for stored in self.store.scan().await? {
            if stored.config.owner_id == owner_id {
                out.push(self.record(stored).await?);
            }
        }
        Ok(out)
    }

    pub async fn list_public(&self) -> Result<Vec<PublicInstance>, HostError> {
        Ok(self
            .store
            .scan()
            .await?
            .into_iter()
            .map(|s| PublicInstance {
                id: s.config.id,
                display_name: s.config.display_name,
                owner_id: s.config.owner_id,
                created_at: s.config.created_at,
            })
            .collect())
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Result<InstanceRecord, HostError> {
        let stored = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| HostError::NotFound(id.clone()))?;
        self.record(stored).await
    }

    /// Merge a partial update and rewrite the manifest. Deliberately does
    /// not restart a live worker: it keeps serving the old config until an
    /// explicit stop and start.
    pub async fn update_instance(
        &self,
        id: &InstanceId,
        update: InstanceUpdate,
        owner_id: &str,
    ) -> Result<InstanceRecord, HostError> {
        let mut stored = self.load_owned(id, owner_id).await?;
        stored.config.apply(update);
        stored.config.validate()?;
        self.store.rewrite(&stored).await?;
        tracing::info!(instance = %id, "instance updated");
        self.record(stored).await
    }

    pub async fn start_instance(&self, id: &InstanceId, owner_id: &str) -> Result<(), HostError> {
        let stored = self.load_owned(id, owner_id).await?;
        let manifest_path = self.store.manifest_path(&stored.file_name);

        let mut cmd = Command::new(&self.worker_bin);
        cmd.arg(&manifest_path)
            .env("AVIARY_DATA_ROOT", &self.data_root);
        self.supervisor.start(id, cmd).await
    }

    pub async fn stop_instance(&self, id: &InstanceId, owner_id: &str) -> Result<(), HostError> {
        self.load_owned(id, owner_id).await?;
        if self.supervisor.stop(id).await {
            Ok(())
        } else {
            Err(HostError::NotRunning(id.clone()))
        }
    }

    /// Stop if running, then remove the manifest, every memory file derived
    /// from this id, and the index entry.
    pub async fn delete_instance(&self, id: &InstanceId, owner_id: &str) -> Result<(), HostError> {
        let stored = self.load_owned(id, owner_id).await?;
        self.supervisor.stop(id).await;
        self.store.remove(&stored).await?;
        tracing::info!(instance = %id, "instance deleted");
        Ok(())
    }

    pub async fn is_running(&self, id: &InstanceId) -> bool {
        self.supervisor.is_running(id).await
    }

    pub fn memory_dir(&self) -> &Path {
        self.store.memory_dir()
    }

    async fn load_owned(
        &self,
        id: &InstanceId,
        owner_id: &str,
    ) -> Result<StoredInstance, HostError> {
        let stored = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| HostError::NotFound(id.clone()))?;
        if stored.config.owner_id != owner_id {
            return Err(HostError::Forbidden);
        }
        Ok(stored)
    }

    async fn record(&self, stored: StoredInstance) -> Result<InstanceRecord, HostError> {
        let running = self.supervisor.is_running(&stored.config.id).await;
        Ok(InstanceRecord {
            config: stored.config,
            running,
            file_name: stored.file_name,
        })
    }
}

//! Persistent instance records.
//!
//! One manifest file per instance is the source of truth; listings scan the
//! instances directory and extract each fenced config block. `index.json`
//! is a lookup optimization only: it is rebuilt opportunistically and every
//! read path falls back to the scan when it is stale, missing, or corrupt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aviary_instance::{InstanceConfig, InstanceId, manifest, memory_file_prefix};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::HostError;

const INDEX_FILE: &str = "index.json";

/// A config plus the manifest file it was loaded from. The file name is
/// fixed at creation (the slug does not follow display-name changes), so
/// rewrites always target the same path.
#[derive(Debug, Clone)]
pub struct StoredInstance {
    pub config: InstanceConfig,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    file_name: String,
    display_name: String,
    owner_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ConfigStore {
    instances_dir: PathBuf,
    memory_dir: PathBuf,
}

impl ConfigStore {
    pub async fn open(data_root: &Path) -> Result<Self, HostError> {
        let instances_dir = aviary_instance::instances_dir(data_root);
        let memory_dir = aviary_instance::memory_dir(data_root);
        tokio::fs::create_dir_all(&instances_dir).await?;
        tokio::fs::create_dir_all(&memory_dir).await?;
        Ok(Self {
            instances_dir,
            memory_dir,
        })
    }

    pub fn manifest_path(&self, file_name: &str) -> PathBuf {
        self.instances_dir.join(file_name)
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Persist a freshly created config. Returns the manifest file name.
    pub async fn insert(&self, config: &InstanceConfig) -> Result<String, HostError> {
        let file_name = manifest::file_name(config);
        self.write_manifest(config, &file_name).await?;
        self.index_upsert(config, &file_name).await;
        Ok(file_name)
    }

    /// Rewrite an existing instance's manifest in place.
    pub async fn rewrite(&self, stored: &StoredInstance) -> Result<(), HostError> {
        self.write_manifest(&stored.config, &stored.file_name).await?;
        self.index_upsert(&stored.config, &stored.file_name).await;
        Ok(())
    }

    async fn write_manifest(
        &self,
        config: &InstanceConfig,
        file_name: &str,
    ) -> Result<(), HostError> {
        let text = manifest::render(config)?;
        write_atomic(&self.manifest_path(file_name), text.as_bytes()).await?;
        Ok(())
    }

    /// Load one instance by id: index fast path, scan fallback.
    pub async fn load(&self, id: &InstanceId) -> Result<Option<StoredInstance>, HostError> {
        if let Some(entry) = self.read_index().await.remove(&id.0)
            && let Ok(text) = tokio::fs::read_to_string(self.manifest_path(&entry.file_name)).await
            && let Ok(config) = manifest::extract(&text)
            && config.id == *id
        {
            return Ok(Some(StoredInstance {
                config,
                file_name: entry.file_name,
            }));
        }

        // Index miss or stale entry: the scan is authoritative.
        Ok(self.scan().await?.into_iter().find(|s| s.config.id == *id))
    }

    /// Every parseable instance on disk. Corrupt manifests are skipped with
    /// a warning, never abort the listing.
    pub async fn scan(&self) -> Result<Vec<StoredInstance>, HostError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.instances_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !manifest::is_manifest_file(&file_name) {
                continue;
            }
            let text = match tokio::fs::read_to_string(entry.path()).await {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(file = %file_name, error = %err, "skipping unreadable manifest");
                    continue;
                }
            };
            match manifest::extract(&text) {
                Ok(config) => out.push(StoredInstance { config, file_name }),
                Err(err) => {
                    tracing::warn!(file = %file_name, error = %err, "skipping corrupt manifest");
                }
            }
        }
        // Stable order for listings.
        out.sort_by(|a, b| a.config.created_at.cmp(&b.config.created_at));
        Ok(out)
    }

    /// Remove an instance's manifest, all of its memory files, and its
    /// index entry.
    pub async fn remove(&self, stored: &StoredInstance) -> Result<(), HostError> {
        tokio::fs::remove_file(self.manifest_path(&stored.file_name)).await?;

        let prefix = memory_file_prefix(&stored.config.id);
        match tokio::fs::read_dir(&self.memory_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with(&prefix)
                        && let Err(err) = tokio::fs::remove_file(entry.path()).await
                    {
                        tracing::warn!(file = %name, error = %err, "failed to remove memory file");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to enumerate memory files");
            }
        }

        let mut index = self.read_index().await;
        if index.remove(&stored.config.id.0).is_some() {
            self.write_index(&index).await;
        }
        Ok(())
    }

    async fn index_upsert(&self, config: &InstanceConfig, file_name: &str) {
        let mut index = self.read_index().await;
        index.insert(
            config.id.0.clone(),
            IndexEntry {
                file_name: file_name.to_string(),
                display_name: config.display_name.clone(),
                owner_id: config.owner_id.clone(),
                created_at: config.created_at,
                updated_at: config.updated_at,
            },
        );
        self.write_index(&index).await;
    }

    async fn read_index(&self) -> BTreeMap<String, IndexEntry> {
        let path = self.instances_dir.join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => index,
                Err(err) => {
                    tracing::warn!(error = %err, "instance index is corrupt, falling back to scans");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    async fn write_index(&self, index: &BTreeMap<String, IndexEntry>) {
        let path = self.instances_dir.join(INDEX_FILE);
        match serde_json::to_vec_pretty(index) {
            Ok(bytes) => {
                if let Err(err) = write_atomic(&path, &bytes).await {
                    tracing::warn!(error = %err, "failed to write instance index");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize instance index");
            }
        }
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path).await
}

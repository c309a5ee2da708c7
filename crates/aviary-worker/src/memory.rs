//! Per-user conversation memory, file-backed with a write-through cache.
//!
//! Records are compact (user, assistant) pairs on disk; the runtime works
//! with the expanded role-tagged view. Files are private to this worker's
//! instance, so no cross-process locking is needed; within the process the
//! one-pending-per-conversation rule keeps writers exclusive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aviary_instance::{InstanceId, memory_file_name};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::completion::{ChatTurn, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug)]
pub struct MemoryStore {
    dir: PathBuf,
    instance: InstanceId,
    limit: usize,
    cache: Mutex<HashMap<u64, Vec<ChatTurn>>>,
}

impl MemoryStore {
    pub fn new(dir: impl Into<PathBuf>, instance: InstanceId, limit: usize) -> Self {
        Self {
            dir: dir.into(),
            instance,
            limit,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, user_id: u64) -> PathBuf {
        self.dir.join(memory_file_name(&self.instance, user_id))
    }

    /// Load a user's history as role-tagged turns. An absent file is an
    /// empty history; a corrupt one fails open to empty with a warning.
    pub async fn get(&self, user_id: u64) -> Vec<ChatTurn> {
        if let Some(hit) = self.cache.lock().await.get(&user_id) {
            return hit.clone();
        }

        let turns = match tokio::fs::read(self.path(user_id)).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<Pair>>(&bytes) {
                Ok(pairs) => expand(pairs),
                Err(err) => {
                    tracing::warn!(user = user_id, error = %err, "corrupt memory file, starting fresh");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        self.cache.lock().await.insert(user_id, turns.clone());
        turns
    }

    /// Collapse to pairs, keep the most recent `limit`, overwrite the file
    /// and refresh the cache with exactly what was persisted.
    pub async fn put(&self, user_id: u64, turns: Vec<ChatTurn>) -> anyhow::Result<()> {
        let mut pairs = collapse(&turns);
        if pairs.len() > self.limit {
            pairs.drain(..pairs.len() - self.limit);
        }

        let data = serde_json::to_vec_pretty(&pairs)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.path(user_id), &data).await?;

        self.cache.lock().await.insert(user_id, expand(pairs));
        Ok(())
    }
}

fn expand(pairs: Vec<Pair>) -> Vec<ChatTurn> {
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs {
        // Older records may predate sender labeling; attribute them to an
        // unknown sender so multi-user context stays consistent.
        let user = if pair.user.contains(':') {
            pair.user
        } else {
            format!("unknown_user: {}", pair.user)
        };
        out.push(ChatTurn::user(user));
        out.push(ChatTurn::assistant(pair.assistant));
    }
    out
}

fn collapse(turns: &[ChatTurn]) -> Vec<Pair> {
    let mut out = Vec::with_capacity(turns.len() / 2);
    let mut pending_user: Option<&str> = None;
    for turn in turns {
        match turn.role {
            Role::System => {}
            Role::User => pending_user = Some(&turn.content),
            Role::Assistant => {
                if let Some(user) = pending_user.take() {
                    out.push(Pair {
                        user: user.to_string(),
                        assistant: turn.content.clone(),
                    });
                }
            }
        }
    }
    out
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path).await
}

//! Worker process supervision.
//!
//! The live map is the only record of "running": an instance is running
//! exactly while its entry is present. Every mutation (start, stop, exit
//! observation) goes through one mutex, and the exit observer is the only
//! mechanism that reconciles state after a termination. Crashed workers are
//! not restarted automatically; restart is always an explicit `start`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use aviary_instance::InstanceId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};

use crate::error::HostError;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Grace between SIGTERM and SIGKILL when stopping a worker.
fn stop_kill_grace() -> Duration {
    Duration::from_millis(
        env_u64("AVIARY_STOP_KILL_AFTER_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(5_000),
    )
}

#[derive(Debug)]
struct WorkerEntry {
    pid: Option<u32>,
    // Tells the exit observer to terminate the child. The observer owns the
    // Child, so signalling and reaping cannot race each other.
    term: mpsc::UnboundedSender<()>,
}

#[derive(Clone, Debug, Default)]
pub struct Supervisor {
    inner: Arc<Mutex<HashMap<String, WorkerEntry>>>,
}

impl Supervisor {
    /// Spawn a worker for `id`. Fails with `AlreadyRunning` while a live
    /// entry exists; the map lock is held across the spawn so two
    /// concurrent starts cannot both succeed.
    pub async fn start(&self, id: &InstanceId, mut cmd: Command) -> Result<(), HostError> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(&id.0) {
            return Err(HostError::AlreadyRunning(id.clone()));
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(HostError::Spawn)?;
        let pid = child.id();
        tracing::info!(instance = %id, pid = pid.unwrap_or_default(), "worker started");

        self.forward_output(&id.0, &mut child);

        let (term_tx, term_rx) = mpsc::unbounded_channel();
        inner.insert(
            id.0.clone(),
            WorkerEntry {
                pid,
                term: term_tx,
            },
        );
        drop(inner);

        self.spawn_exit_observer(id.0.clone(), child, pid, term_rx);
        Ok(())
    }

    /// Signal a worker to terminate. The map entry is removed immediately:
    /// from the caller's point of view the instance is no longer running.
    /// Returns whether anything was running.
    pub async fn stop(&self, id: &InstanceId) -> bool {
        let entry = self.inner.lock().await.remove(&id.0);
        match entry {
            Some(entry) => {
                // The observer may already be gone if the worker just
                // exited on its own; that is fine.
                let _ = entry.term.send(());
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, id: &InstanceId) -> bool {
        self.inner.lock().await.contains_key(&id.0)
    }

    pub async fn running_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    fn forward_output(&self, id: &str, child: &mut Child) {
        if let Some(out) = child.stdout.take() {
            let id = id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(instance = %id, "[worker stdout] {line}");
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let id = id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(instance = %id, "[worker stderr] {line}");
                }
            });
        }
    }

    /// The observer owns the child: it reaps a natural exit, and on a stop
    /// request delivers SIGTERM and escalates to SIGKILL after a grace
    /// period. Either way it removes the map entry at most once, guarded by
    /// pid so a restart under the same id is never clobbered.
    fn spawn_exit_observer(
        &self,
        id: String,
        mut child: Child,
        pid: Option<u32>,
        mut term_rx: mpsc::UnboundedReceiver<()>,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = child.wait() => {
                    match res {
                        Ok(status) if status.success() => {
                            tracing::info!(instance = %id, "worker exited cleanly");
                        }
                        Ok(status) => {
                            tracing::warn!(
                                instance = %id,
                                exit_code = status.code().unwrap_or_default(),
                                "worker exited abnormally"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(instance = %id, error = %err, "worker wait failed");
                        }
                    }
                    remove_if_current(&inner, &id, pid).await;
                }
                _ = term_rx.recv() => {
                    terminate(&id, &mut child).await;
                    // The stop path already removed the entry; this only
                    // covers the case where it did not.
                    remove_if_current(&inner, &id, pid).await;
                }
            }
        });
    }
}

async fn remove_if_current(
    inner: &Arc<Mutex<HashMap<String, WorkerEntry>>>,
    id: &str,
    pid: Option<u32>,
) {
    let mut map = inner.lock().await;
    let Some(e) = map.get(id) else {
        return;
    };
    if e.pid == pid {
        map.remove(id);
    }
}

async fn terminate(id: &str, child: &mut Child) {
    send_sigterm(child);
    match tokio::time::timeout(stop_kill_grace(), child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(
                instance = %id,
                exit_code = status.code().unwrap_or_default(),
                "worker stopped"
            );
        }
        Ok(Err(err)) => {
            tracing::warn!(instance = %id, error = %err, "worker wait failed during stop");
        }
        Err(_) => {
            tracing::warn!(instance = %id, "worker ignored SIGTERM, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Child) {
    // No SIGTERM off unix; the escalation path kills outright.
    let _ = child;
}

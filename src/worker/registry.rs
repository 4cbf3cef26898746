//! Worker registry — at most one live worker per workspace key.
//!
//! Replacement is break-before-make: the old worker is cancelled and awaited
//! (up to a grace period) before its successor starts, so two workers never
//! hold the same workspace's surface connection at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::feed::event::WorkspaceSettings;
use crate::worker::worker::{WorkerCommand, WorkerContext, WorkerDeps, run_worker};

const COMMAND_BUFFER: usize = 64;

struct WorkerHandle {
    /// Distinguishes this incarnation from any later one under the same key.
    id: Uuid,
    settings: WorkspaceSettings,
    cancel: CancellationToken,
    commands: mpsc::Sender<WorkerCommand>,
    join: JoinHandle<()>,
}

pub struct WorkerRegistry {
    deps: WorkerDeps,
    grace: Duration,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn new(deps: WorkerDeps, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            deps,
            grace,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Start a worker for `key` with `settings`, first stopping any worker
    /// already registered under that key.
    pub async fn upsert(self: &Arc<Self>, key: &str, settings: WorkspaceSettings) {
        let previous = self.workers.lock().await.remove(key);
        if let Some(handle) = previous {
            tracing::info!(workspace = %key, "Replacing worker with fresh settings");
            self.stop_handle(key, handle).await;
        } else {
            tracing::info!(workspace = %key, "Starting worker");
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        // The task waits for this before running so a fast crash cannot race
        // the handle registration below.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let ctx = WorkerContext {
            workspace: key.to_string(),
            settings: settings.clone(),
            deps: self.deps.clone(),
        };
        let registry = Arc::clone(self);
        let workspace = key.to_string();
        let task_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let _ = registered_rx.await;
            match run_worker(ctx, commands_rx, task_cancel).await {
                Ok(()) => tracing::info!(workspace = %workspace, "Worker stopped"),
                Err(e) => {
                    tracing::error!(
                        workspace = %workspace,
                        error = %e,
                        "Worker crashed; next settings update restarts it"
                    );
                    registry.forget_incarnation(&workspace, id).await;
                }
            }
        });

        self.workers.lock().await.insert(
            key.to_string(),
            WorkerHandle {
                id,
                settings,
                cancel,
                commands: commands_tx,
                join,
            },
        );
        let _ = registered_tx.send(());
    }

    /// Stop and forget the worker for `key`. No-op when none is registered.
    pub async fn remove(&self, key: &str) {
        let Some(handle) = self.workers.lock().await.remove(key) else {
            tracing::debug!(workspace = %key, "Remove requested for unknown workspace");
            return;
        };
        tracing::info!(workspace = %key, "Stopping worker");
        self.stop_handle(key, handle).await;
    }

    /// Command channel of the running worker for `key`, if any.
    pub async fn lookup(&self, key: &str) -> Option<mpsc::Sender<WorkerCommand>> {
        self.workers
            .lock()
            .await
            .get(key)
            .map(|h| h.commands.clone())
    }

    /// Settings snapshot the worker for `key` was started with.
    pub async fn current_settings(&self, key: &str) -> Option<WorkspaceSettings> {
        self.workers.lock().await.get(key).map(|h| h.settings.clone())
    }

    pub async fn running(&self, key: &str) -> bool {
        self.workers.lock().await.contains_key(key)
    }

    pub async fn count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Stop every worker. Used on shutdown.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, WorkerHandle)> =
            self.workers.lock().await.drain().collect();
        for (key, handle) in drained {
            self.stop_handle(&key, handle).await;
        }
    }

    /// Drop the registry entry for a crashed worker, but only if it is still
    /// the same incarnation. A replacement started in the meantime stays.
    async fn forget_incarnation(&self, key: &str, id: Uuid) {
        let mut workers = self.workers.lock().await;
        if workers.get(key).is_some_and(|h| h.id == id) {
            workers.remove(key);
        }
    }

    /// Cancel a worker and wait for it, giving up after the grace period.
    async fn stop_handle(&self, key: &str, handle: WorkerHandle) {
        handle.cancel.cancel();
        match tokio::time::timeout(self.grace, handle.join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(workspace = %key, error = %e, "Worker task panicked while stopping")
            }
            Err(_) => {
                tracing::error!(
                    workspace = %key,
                    grace_secs = self.grace.as_secs(),
                    "Worker did not stop within grace period; abandoning it"
                );
            }
        }
    }
}

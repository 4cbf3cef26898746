//! Per-workspace worker — owns one surface connection, reconciles thread
//! activity into the mirror and delivers outbound messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use futures::StreamExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Error};
use crate::feed::event::{ThreadMessagePayload, WorkspaceSettings};
use crate::store::ThreadStore;
use crate::surface::{ChatSurface, ExternalThreadRef, SurfaceConnector, SurfaceEvent};
use crate::sync::{self, MirrorState};

/// Commands the registry can route to a running worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Deliver an outbound mirror message to its external thread.
    Deliver { message: ThreadMessagePayload },
}

/// Shared services handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn ThreadStore>,
    pub connector: Arc<dyn SurfaceConnector>,
}

pub(crate) struct WorkerContext {
    pub workspace: String,
    pub settings: WorkspaceSettings,
    pub deps: WorkerDeps,
}

/// Run one worker until cancelled. A returned error means the worker
/// crashed; the registry logs it and forgets the worker.
pub(crate) async fn run_worker(
    ctx: WorkerContext,
    mut commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let surface = ctx
        .deps
        .connector
        .connect(&ctx.workspace, &ctx.settings)
        .await?;
    let mut events = surface.start().await?;

    tracing::info!(workspace = %ctx.workspace, surface = surface.name(), "Worker started");

    // Mirror state per external thread, lazily rebuilt from the store.
    let mut mirrors: HashMap<String, MirrorState> = HashMap::new();

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),

            event = events.next() => match event {
                Some(SurfaceEvent::ThreadActivity { thread }) => {
                    if let Err(e) = sync_thread(&ctx, surface.as_ref(), &mut mirrors, &thread).await {
                        tracing::warn!(
                            workspace = %ctx.workspace,
                            thread = %thread.id,
                            error = %e,
                            "Thread sync failed; next activity retries"
                        );
                    }
                }
                None => {
                    break Err(Error::from(DeliveryError::Unreachable(format!(
                        "{} event stream ended",
                        surface.name()
                    ))));
                }
            },

            command = commands.recv() => match command {
                Some(WorkerCommand::Deliver { message }) => {
                    deliver(&ctx, surface.as_ref(), &message).await;
                }
                // Registry dropped its sender: treat as a stop request.
                None => break Ok(()),
            },
        }
    };

    surface.shutdown().await;
    result
}

/// Reconcile one external thread's history into the mirror.
async fn sync_thread(
    ctx: &WorkerContext,
    surface: &dyn ChatSurface,
    mirrors: &mut HashMap<String, MirrorState>,
    thread: &ExternalThreadRef,
) -> Result<usize, crate::error::SyncError> {
    if !mirrors.contains_key(&thread.id) {
        let state = sync::ensure_state(
            ctx.deps.store.as_ref(),
            &ctx.settings.group_id,
            thread,
        )
        .await?;
        mirrors.insert(thread.id.clone(), state);
    }
    let Some(state) = mirrors.get_mut(&thread.id) else {
        return Ok(0);
    };

    let history = surface.fetch_history(thread).await?;
    sync::merge_history(ctx.deps.store.as_ref(), state, &history).await
}

/// Deliver an outbound message to its external thread. Failures are logged
/// and dropped; delivery is best-effort and never crashes the worker.
async fn deliver(ctx: &WorkerContext, surface: &dyn ChatSurface, message: &ThreadMessagePayload) {
    let Some(search_key) = message.search_key.as_deref() else {
        tracing::error!(
            workspace = %ctx.workspace,
            thread = %message.thread_id,
            "Outbound message has no search key; dropping"
        );
        return;
    };
    let Some(destination) = parse_destination(search_key) else {
        tracing::error!(
            workspace = %ctx.workspace,
            search_key,
            "Outbound message search key has no usable destination; dropping"
        );
        return;
    };

    // Double-check against the stored thread record before posting anywhere.
    match ctx.deps.store.get_thread(message.thread_id).await {
        Ok(Some(record)) if record.search_key != search_key => {
            tracing::error!(
                workspace = %ctx.workspace,
                thread = %message.thread_id,
                message_key = search_key,
                thread_key = %record.search_key,
                "Search key mismatch between message and thread; dropping"
            );
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(
                workspace = %ctx.workspace,
                thread = %message.thread_id,
                error = %e,
                "Could not verify outbound destination; dropping"
            );
            return;
        }
    }

    if let Err(e) = surface.send(destination, &message.content).await {
        tracing::error!(
            workspace = %ctx.workspace,
            destination,
            error = %e,
            "Outbound delivery failed"
        );
    } else {
        tracing::info!(
            workspace = %ctx.workspace,
            destination,
            "Delivered outbound message"
        );
    }
}

/// Extract the external thread id from a mirror search key.
fn parse_destination(search_key: &str) -> Option<&str> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^support:(\d+)$").unwrap()
    });
    pattern
        .captures(search_key)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_from_search_key() {
        assert_eq!(parse_destination("support:1378031356453589073"), Some("1378031356453589073"));
        assert_eq!(parse_destination("support:"), None);
        assert_eq!(parse_destination("other:123"), None);
        assert_eq!(parse_destination("support:abc"), None);
        assert_eq!(parse_destination("support:1 trailing"), None);
    }
}

//! Outbound forwarding — routes newly appended mirror messages to the
//! worker that owns the workspace.

use std::sync::Arc;

use crate::feed::event::ThreadMessagePayload;
use crate::worker::{WorkerCommand, WorkerRegistry};

/// Hands outbound mirror messages to the owning worker's command channel.
/// Delivery is best-effort: missing workers and closed channels are logged
/// and the message is dropped.
pub struct MessageForwarder {
    registry: Arc<WorkerRegistry>,
}

impl MessageForwarder {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn forward(&self, workspace: &str, message: ThreadMessagePayload) {
        let Some(commands) = self.registry.lookup(workspace).await else {
            tracing::error!(
                workspace = %workspace,
                thread = %message.thread_id,
                "Outbound message for workspace with no running worker; dropping"
            );
            return;
        };

        if let Err(e) = commands.send(WorkerCommand::Deliver { message }).await {
            tracing::error!(
                workspace = %workspace,
                error = %e,
                "Worker command channel closed; dropping outbound message"
            );
        }
    }
}

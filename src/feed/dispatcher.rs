//! Event dispatcher — routes classified feed events to the worker registry
//! and the outbound forwarder.

use std::sync::Arc;

use crate::feed::event::{FeedAction, FeedEvent};
use crate::forward::MessageForwarder;
use crate::worker::WorkerRegistry;

pub struct EventDispatcher {
    registry: Arc<WorkerRegistry>,
    forwarder: MessageForwarder,
}

impl EventDispatcher {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            forwarder: MessageForwarder::new(Arc::clone(&registry)),
            registry,
        }
    }

    /// Route one feed event. Never fails: events that cannot be acted on
    /// are logged and dropped so the feed loop keeps consuming.
    pub async fn dispatch(&self, event: FeedEvent) {
        let workspace = event.workspace_id.clone();
        let action = event.action.clone();
        let pubsub = event.pubsub.clone();

        match event.classify() {
            FeedAction::Upsert { settings } => {
                self.registry.upsert(&workspace, settings).await;
            }
            FeedAction::Delete => {
                self.registry.remove(&workspace).await;
            }
            FeedAction::MessageAppended { message } => {
                self.forwarder.forward(&workspace, message).await;
            }
            FeedAction::Unrecognized => {
                tracing::debug!(
                    workspace = %workspace,
                    action = %action,
                    pubsub = %pubsub,
                    "Dropping feed event with no matching route"
                );
            }
        }
    }
}

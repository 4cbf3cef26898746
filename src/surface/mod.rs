//! Chat surfaces — external systems whose threads the relay mirrors.
//!
//! A surface exposes a stream of activity events, can fetch the full history
//! of one of its threads, and can deliver outbound messages into a thread.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::DeliveryError;
use crate::feed::event::WorkspaceSettings;

pub mod discord;

pub use discord::{DiscordConnector, DiscordSurface};

/// A thread as the external surface knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalThreadRef {
    /// Surface-native identifier, opaque to the relay.
    pub id: String,
    pub title: String,
}

/// One message observed on the surface.
#[derive(Debug, Clone)]
pub struct ExternalMessage {
    /// Surface-native message id, unique within the surface.
    pub external_id: String,
    pub author: String,
    pub content: String,
    pub observed_at: DateTime<Utc>,
}

/// Something happened on the surface that a worker should react to.
#[derive(Debug, Clone)]
pub enum SurfaceEvent {
    /// A thread saw new activity; its history may have diverged from the
    /// mirror and should be re-reconciled.
    ThreadActivity { thread: ExternalThreadRef },
}

pub type SurfaceStream = Pin<Box<dyn Stream<Item = SurfaceEvent> + Send>>;

/// A live connection to one external chat surface.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Start observing and return the event stream. Called once.
    async fn start(&self) -> Result<SurfaceStream, DeliveryError>;

    /// Full message history of a thread, oldest first.
    async fn fetch_history(
        &self,
        thread: &ExternalThreadRef,
    ) -> Result<Vec<ExternalMessage>, DeliveryError>;

    /// Post `content` into the given thread.
    async fn send(&self, thread_id: &str, content: &str) -> Result<(), DeliveryError>;

    /// Stop background work. Default is a no-op.
    async fn shutdown(&self) {}
}

/// Builds surfaces from per-workspace settings. Each worker gets its own
/// surface instance so replacing a worker replaces its connection too.
#[async_trait]
pub trait SurfaceConnector: Send + Sync {
    async fn connect(
        &self,
        workspace: &str,
        settings: &WorkspaceSettings,
    ) -> Result<Arc<dyn ChatSurface>, DeliveryError>;
}

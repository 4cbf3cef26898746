//! Wire model for feed events and their structural classification.

use secrecy::SecretString;
use serde::Deserialize;
use uuid::Uuid;

/// Role written into the mirror for messages synced from the surface.
pub const MIRRORED_ROLE: &str = "user";

/// Role of messages the relay reposts back to the surface.
pub const FORWARDED_ROLE: &str = "assistant";

/// Pubsub discriminant of workspace settings records.
pub const SETTINGS_PUBSUB: &str = "setting$support_settings";

/// Per-workspace settings carried by an upsert event.
///
/// Opaque to the dispatcher; the worker uses the credentials to open its own
/// surface session.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSettings {
    /// Surface channels the worker watches for new support threads.
    pub channel_list: Vec<String>,
    /// Token for the workspace's surface session.
    pub surface_token: SecretString,
    /// Group the workspace's mirror threads live in.
    pub group_id: String,
    /// The relay's own user id on the surface (its messages are not mirrored).
    pub bot_user_id: String,
    /// API key for the thread store backend.
    pub api_key: SecretString,
}

/// Mirror-thread message carried by a feed event.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessagePayload {
    pub thread_id: Uuid,
    pub alt: i64,
    pub seq: i64,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub app_specific: Option<serde_json::Value>,
    /// Search key of the owning thread. Arrives with the subscription only;
    /// the forwarder uses it to resolve the surface destination.
    #[serde(default)]
    pub search_key: Option<String>,
}

/// One record from the feed subscription. Immutable once received.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEvent {
    /// "INSERT" | "UPDATE" | "DELETE".
    pub action: String,
    /// Workspace key this event belongs to.
    pub workspace_id: String,
    /// Record-kind discriminant.
    pub pubsub: String,
    #[serde(default)]
    pub settings: Option<WorkspaceSettings>,
    #[serde(default)]
    pub thread_message: Option<ThreadMessagePayload>,
}

/// Structural classification of a feed event.
#[derive(Debug)]
pub enum FeedAction {
    /// Start or replace the worker for this workspace.
    Upsert { settings: WorkspaceSettings },
    /// Stop the worker for this workspace.
    Delete,
    /// A message the relay did not write appeared in a mirror thread.
    MessageAppended { message: ThreadMessagePayload },
    /// Shape not understood; logged and dropped, never fatal.
    Unrecognized,
}

impl FeedEvent {
    /// Classify by payload shape. Unknown shapes fail closed.
    pub fn classify(self) -> FeedAction {
        if let Some(settings) = self.settings {
            return FeedAction::Upsert { settings };
        }
        if self.action == "DELETE" && self.pubsub == SETTINGS_PUBSUB {
            return FeedAction::Delete;
        }
        if self.action == "INSERT" {
            if let Some(message) = self.thread_message {
                if message.role != MIRRORED_ROLE {
                    return FeedAction::MessageAppended { message };
                }
                // Our own mirror writes echo back through the subscription.
                return FeedAction::Unrecognized;
            }
        }
        FeedAction::Unrecognized
    }
}

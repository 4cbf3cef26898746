//! Discord surface — polls watched channels for thread activity and posts
//! replies through the REST API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;
use crate::feed::event::WorkspaceSettings;
use crate::surface::{
    ChatSurface, ExternalMessage, ExternalThreadRef, SurfaceConnector, SurfaceEvent, SurfaceStream,
};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Maximum message length for Discord's create-message API.
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

const POLL_INTERVAL_SECS: u64 = 5;
const HISTORY_PAGE_LIMIT: usize = 100;

/// Discord surface — watches a list of channels via REST polling.
pub struct DiscordSurface {
    token: String,
    channel_list: Vec<String>,
    bot_user_id: String,
    client: reqwest::Client,
    stop: CancellationToken,
}

impl DiscordSurface {
    pub fn new(token: String, channel_list: Vec<String>, bot_user_id: String) -> Self {
        Self {
            token,
            channel_list,
            bot_user_id,
            client: reqwest::Client::new(),
            stop: CancellationToken::new(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<Value>, DeliveryError> {
        let mut url = format!(
            "{DISCORD_API_BASE}/channels/{channel_id}/messages?limit={HISTORY_PAGE_LIMIT}"
        );
        if let Some(after) = after {
            url.push_str(&format!("&after={after}"));
        }

        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Http(format!(
                "GET messages for {channel_id}: {status} {body}"
            )));
        }

        let page: Vec<Value> = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;
        Ok(page)
    }

    /// Send a single chunk (≤2000 chars).
    async fn send_chunk(&self, channel_id: &str, content: &str) -> Result<(), DeliveryError> {
        let body = serde_json::json!({ "content": content });
        let resp = self
            .client
            .post(format!("{DISCORD_API_BASE}/channels/{channel_id}/messages"))
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed {
                destination: channel_id.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::SendFailed {
                destination: channel_id.to_string(),
                reason: format!("createMessage: {status} {text}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatSurface for DiscordSurface {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&self) -> Result<SurfaceStream, DeliveryError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let token = self.token.clone();
        let channels = self.channel_list.clone();
        let bot_user_id = self.bot_user_id.clone();
        let client = self.client.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            // Per-channel newest-seen message id. Seeded on the first poll so
            // startup does not replay a channel's entire backlog as activity.
            let mut cursors: std::collections::HashMap<String, Option<String>> =
                channels.iter().map(|c| (c.clone(), None)).collect();

            tracing::info!(channels = channels.len(), "Discord surface polling");

            loop {
                for channel_id in &channels {
                    let cursor = cursors.get(channel_id).cloned().flatten();
                    let seeding = cursor.is_none();

                    let mut url = format!(
                        "{DISCORD_API_BASE}/channels/{channel_id}/messages?limit={}",
                        if seeding { 1 } else { HISTORY_PAGE_LIMIT }
                    );
                    if let Some(ref after) = cursor {
                        url.push_str(&format!("&after={after}"));
                    }

                    let resp = match client
                        .get(&url)
                        .header("Authorization", format!("Bot {token}"))
                        .send()
                        .await
                    {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("Discord poll error: {e}");
                            continue;
                        }
                    };

                    let page: Vec<Value> = match resp.json().await {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("Discord parse error: {e}");
                            continue;
                        }
                    };

                    if let Some(newest) = newest_message_id(&page) {
                        cursors.insert(channel_id.clone(), Some(newest));
                    }
                    if seeding {
                        continue;
                    }

                    // Pages arrive newest-first; walk them oldest-first.
                    for message in page.iter().rev() {
                        let Some(activity) = activity_of(message, channel_id, &bot_user_id)
                        else {
                            continue;
                        };
                        if tx
                            .send(SurfaceEvent::ThreadActivity { thread: activity })
                            .is_err()
                        {
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ev| (ev, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn fetch_history(
        &self,
        thread: &ExternalThreadRef,
    ) -> Result<Vec<ExternalMessage>, DeliveryError> {
        let mut history = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let page = self.fetch_page(&thread.id, after.as_deref()).await?;
            let page_len = page.len();
            after = newest_message_id(&page).or(after);
            history.extend(page_to_messages(&page, &self.bot_user_id));
            if page_len < HISTORY_PAGE_LIMIT {
                break;
            }
        }

        history.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        Ok(history)
    }

    async fn send(&self, thread_id: &str, content: &str) -> Result<(), DeliveryError> {
        for chunk in split_message(content, DISCORD_MAX_MESSAGE_LENGTH) {
            self.send_chunk(thread_id, &chunk).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.stop.cancel();
    }
}

/// Builds a `DiscordSurface` from workspace settings.
#[derive(Default)]
pub struct DiscordConnector;

impl DiscordConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SurfaceConnector for DiscordConnector {
    async fn connect(
        &self,
        workspace: &str,
        settings: &WorkspaceSettings,
    ) -> Result<Arc<dyn ChatSurface>, DeliveryError> {
        if settings.channel_list.is_empty() {
            return Err(DeliveryError::StartupFailed {
                name: "discord".into(),
                reason: format!("workspace {workspace} has no channels configured"),
            });
        }
        Ok(Arc::new(DiscordSurface::new(
            settings.surface_token.expose_secret().to_string(),
            settings.channel_list.clone(),
            settings.bot_user_id.clone(),
        )))
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Highest message id on a page. Snowflakes are numeric, so compare as u64.
fn newest_message_id(page: &[Value]) -> Option<String> {
    page.iter()
        .filter_map(|m| m.get("id").and_then(Value::as_str))
        .max_by_key(|id| id.parse::<u64>().unwrap_or(0))
        .map(str::to_string)
}

/// Thread reference a new message should count as activity for, or `None`
/// when the message is the relay's own.
fn activity_of(message: &Value, channel_id: &str, bot_user_id: &str) -> Option<ExternalThreadRef> {
    let author = message
        .get("author")
        .and_then(|a| a.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if author == bot_user_id {
        return None;
    }

    // A message that spawned a thread counts as activity on that thread;
    // anything else is activity on the watched channel itself.
    if let Some(thread) = message.get("thread") {
        let id = thread.get("id").and_then(Value::as_str)?;
        let title = thread
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string();
        return Some(ExternalThreadRef {
            id: id.to_string(),
            title,
        });
    }

    Some(ExternalThreadRef {
        id: channel_id.to_string(),
        title: channel_id.to_string(),
    })
}

/// Map a history page to external messages, skipping the relay's own posts.
fn page_to_messages(page: &[Value], bot_user_id: &str) -> Vec<ExternalMessage> {
    page.iter()
        .filter_map(|m| {
            let id = m.get("id").and_then(Value::as_str)?;
            let author = m.get("author")?;
            let author_id = author.get("id").and_then(Value::as_str)?;
            if author_id == bot_user_id {
                return None;
            }
            let content = m.get("content").and_then(Value::as_str)?;
            let author_name = author
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let observed_at = m
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            Some(ExternalMessage {
                external_id: id.to_string(),
                author: author_name.to_string(),
                content: content.to_string(),
                observed_at,
            })
        })
        .collect()
}

/// Split text into chunks of at most `max_len` bytes, preferring newline
/// then space boundaries. The hard cut always lands on a char boundary so
/// multibyte content never panics the slice.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut hard_cut = max_len;
        while !remaining.is_char_boundary(hard_cut) {
            hard_cut -= 1;
        }

        let chunk = &remaining[..hard_cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(hard_cut);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { hard_cut } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

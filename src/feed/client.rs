//! HTTP feed client — long-polls the feed service for subscription events.

use std::time::Duration;

use crate::error::FeedError;
use crate::feed::event::FeedEvent;

/// Server-side hold time for one long-poll request.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Client-side request deadline; slightly above the server hold time.
const REQUEST_DEADLINE: Duration = Duration::from_secs(POLL_TIMEOUT_SECS + 10);

/// Connects to the feed service. Each successful `connect()` yields a fresh
/// [`FeedConnection`]; the supervisor calls it again after transport failures.
pub struct FeedClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl FeedClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url.trim_end_matches('/'))
    }

    /// Perform the handshake and open a poll connection.
    pub async fn connect(&self) -> Result<FeedConnection, FeedError> {
        tracing::info!(url = %self.base_url, "Connecting to feed");

        let resp = self
            .client
            .get(self.api_url("feed/handshake"))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_DEADLINE)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        check_status(status.as_u16(), "handshake")?;

        let text = resp.text().await.map_err(transport_error)?;
        let body: serde_json::Value = serde_json::from_str(&text)?;
        let cursor = body.get("cursor").and_then(serde_json::Value::as_i64).unwrap_or(0);

        Ok(FeedConnection {
            client: self.client.clone(),
            poll_url: self.api_url("feed/poll"),
            api_key: self.api_key.clone(),
            cursor,
        })
    }
}

/// One live subscription session. The cursor advances past every delivered
/// event, so each event is consumed exactly once per connection.
#[derive(Debug)]
pub struct FeedConnection {
    client: reqwest::Client,
    poll_url: String,
    api_key: String,
    cursor: i64,
}

impl FeedConnection {
    /// Long-poll for the next batch of events. An empty batch means the hold
    /// time elapsed with nothing new.
    pub async fn next_batch(&mut self) -> Result<Vec<FeedEvent>, FeedError> {
        let body = serde_json::json!({
            "cursor": self.cursor,
            "timeout": POLL_TIMEOUT_SECS,
        });

        let resp = self
            .client
            .post(&self.poll_url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_DEADLINE)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        check_status(resp.status().as_u16(), "poll")?;

        let text = resp.text().await.map_err(transport_error)?;
        let data: serde_json::Value = serde_json::from_str(&text)?;
        Ok(parse_batch(&data, &mut self.cursor))
    }

    /// Current poll cursor.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }
}

/// Decode a poll response, advancing the cursor past every delivered record.
/// Records that do not decode as [`FeedEvent`] are logged and dropped; one
/// bad record must not kill the subscription.
fn parse_batch(data: &serde_json::Value, cursor: &mut i64) -> Vec<FeedEvent> {
    if let Some(next) = data.get("cursor").and_then(serde_json::Value::as_i64) {
        *cursor = next;
    }

    let Some(records) = data.get("events").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };

    let mut events = Vec::with_capacity(records.len());
    for record in records {
        match serde_json::from_value::<FeedEvent>(record.clone()) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable feed record");
            }
        }
    }
    events
}

/// Map an HTTP status to the feed error taxonomy. 401/403 is the
/// distinguished credential-rejected condition; other non-success statuses
/// are protocol errors the supervisor treats as fatal.
fn check_status(status: u16, context: &str) -> Result<(), FeedError> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(FeedError::AuthRejected {
            status,
            reason: format!("{context} rejected"),
        }),
        _ => Err(FeedError::Protocol(format!("{context} returned HTTP {status}"))),
    }
}

/// Map a reqwest error to the transient transport taxonomy.
fn transport_error(e: reqwest::Error) -> FeedError {
    if e.is_timeout() {
        FeedError::Timeout(REQUEST_DEADLINE)
    } else if e.is_connect() {
        FeedError::Connect(e.to_string())
    } else {
        FeedError::Disconnected(e.to_string())
    }
}

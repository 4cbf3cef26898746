//! Error types for the relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Feed transport errors. The supervisor classifies these into transient
/// (retried with backoff) and fatal (propagated).
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Connection attempt failed: {0}")]
    Connect(String),

    #[error("Connection dropped: {0}")]
    Disconnected(String),

    #[error("Transport timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential rejected by feed (HTTP {status}): {reason}")]
    AuthRejected { status: u16, reason: String },

    #[error("Feed protocol error: {0}")]
    Protocol(String),

    #[error("Malformed feed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Giving up after {attempts} consecutive transport errors: {last}")]
    Escalated { attempts: u32, last: Box<FeedError> },
}

impl FeedError {
    /// Whether the supervisor may retry this error with backoff.
    ///
    /// Credential rejection counts as transient on purpose: a flaky
    /// credential service is indistinguishable from a real rejection, so it
    /// follows the same retry arithmetic and only the log line differs.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FeedError::Connect(_)
                | FeedError::Disconnected(_)
                | FeedError::Timeout(_)
                | FeedError::Io(_)
                | FeedError::AuthRejected { .. }
        )
    }

    /// Whether this is the distinguished credential-rejected condition.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, FeedError::AuthRejected { .. })
    }
}

/// Thread store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Merge/sync errors, surfaced to the owning worker which decides whether to
/// retry on the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Durable append rejected: {0}")]
    Append(#[source] StoreError),

    #[error("Store error during sync: {0}")]
    Store(#[from] StoreError),

    #[error("Ambiguous mirror thread: {count} threads match search key {search_key}")]
    AmbiguousThread { search_key: String, count: usize },

    #[error("External history fetch failed: {0}")]
    History(#[from] DeliveryError),
}

/// Errors from the external chat surface (history fetch, outbound send).
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Surface {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send to {destination}: {reason}")]
    SendFailed { destination: String, reason: String },

    #[error("Destination not reachable: {0}")]
    Unreachable(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid destination reference: {0}")]
    InvalidDestination(String),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FeedError::Connect("refused".into()).is_transient());
        assert!(FeedError::Disconnected("reset".into()).is_transient());
        assert!(FeedError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(
            FeedError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"))
                .is_transient()
        );
    }

    #[test]
    fn auth_rejection_is_transient_but_distinguished() {
        let e = FeedError::AuthRejected {
            status: 403,
            reason: "bad key".into(),
        };
        assert!(e.is_transient());
        assert!(e.is_auth_rejected());
    }

    #[test]
    fn protocol_and_escalated_are_fatal() {
        assert!(!FeedError::Protocol("unexpected frame".into()).is_transient());
        let esc = FeedError::Escalated {
            attempts: 3,
            last: Box::new(FeedError::Connect("refused".into())),
        };
        assert!(!esc.is_transient());
        assert!(!esc.is_auth_rejected());
    }
}

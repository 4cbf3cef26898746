//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Retry/escalation policy for the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive transient errors before giving up.
    pub max_attempts: u32,
    /// Failures further apart than this reset the consecutive counter.
    pub reset_window: Duration,
    /// Fixed sleep between reconnect attempts.
    pub cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            reset_window: Duration::from_secs(300), // 5 minutes
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the feed service.
    pub feed_url: String,
    /// API key presented to the feed service.
    pub feed_api_key: String,
    /// Path to the local thread database.
    pub db_path: String,
    /// Feed reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// How long to wait for a replaced worker to finish before proceeding.
    pub worker_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            feed_url: "http://localhost:8008".to_string(),
            feed_api_key: String::new(),
            db_path: "./data/support-relay.db".to_string(),
            reconnect: ReconnectPolicy::default(),
            worker_grace: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Build configuration from environment variables.
    ///
    /// `RELAY_FEED_URL` and `RELAY_FEED_API_KEY` are required; everything else
    /// has defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let feed_url = std::env::var("RELAY_FEED_URL")
            .map_err(|_| ConfigError::MissingEnvVar("RELAY_FEED_URL".into()))?;
        let feed_api_key = std::env::var("RELAY_FEED_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("RELAY_FEED_API_KEY".into()))?;

        let db_path = std::env::var("RELAY_DB_PATH")
            .unwrap_or_else(|_| "./data/support-relay.db".to_string());

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            max_attempts: env_parse("RELAY_MAX_ATTEMPTS", defaults.max_attempts)?,
            reset_window: Duration::from_secs(env_parse(
                "RELAY_RESET_WINDOW_SECS",
                defaults.reset_window.as_secs(),
            )?),
            cooldown: Duration::from_secs(env_parse(
                "RELAY_COOLDOWN_SECS",
                defaults.cooldown.as_secs(),
            )?),
        };

        let worker_grace = Duration::from_secs(env_parse("RELAY_WORKER_GRACE_SECS", 10)?);

        Ok(Self {
            feed_url,
            feed_api_key,
            db_path,
            reconnect,
            worker_grace,
        })
    }
}

/// Parse an env var if present, falling back to a default.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_documented_constants() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.reset_window, Duration::from_secs(300));
        assert_eq!(p.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn env_parse_falls_back_to_default() {
        let v: u32 = env_parse("RELAY_TEST_UNSET_VAR", 7).unwrap();
        assert_eq!(v, 7);
    }
}

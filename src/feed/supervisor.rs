//! Reconnect supervision for the feed subscription.
//!
//! Owns one connection at a time. Transient transport errors are retried
//! after a fixed cooldown; sustained instability (too many consecutive errors
//! inside the reset window) escalates to a fatal error instead of retrying
//! forever.

use std::future::Future;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::error::FeedError;

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Sleep for the cooldown, then reconnect.
    Retry(std::time::Duration),
    /// Stop retrying and re-raise the last error.
    Escalate,
}

/// Consecutive-failure arithmetic. Time is injected so the decision is a pure
/// function of the failure history.
#[derive(Debug)]
pub struct BackoffPolicy {
    policy: ReconnectPolicy,
    attempts: u32,
    last_failure: Option<Instant>,
}

impl BackoffPolicy {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_failure: None,
        }
    }

    /// Consecutive failures recorded so far (within the reset window).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure at `now` and decide whether to retry.
    ///
    /// Failures further apart than the reset window are not "consecutive":
    /// the counter restarts at 1 for this failure.
    pub fn on_failure(&mut self, now: Instant) -> BackoffDecision {
        if let Some(last) = self.last_failure {
            if now.duration_since(last) > self.policy.reset_window {
                self.attempts = 0;
            }
        }
        self.attempts += 1;
        self.last_failure = Some(now);

        if self.attempts >= self.policy.max_attempts {
            BackoffDecision::Escalate
        } else {
            BackoffDecision::Retry(self.policy.cooldown)
        }
    }
}

/// Supervises a single feed subscription, reconnecting on transient errors.
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Run `connect` / `handler` until clean shutdown or fatal failure.
    ///
    /// `handler` runs the subscription on the connection and is expected to
    /// return `Ok(())` only on shutdown. Transient errors from either closure
    /// feed the backoff arithmetic; non-transient errors propagate
    /// immediately. `shutdown` interrupts the cooldown sleep.
    pub async fn run<C, CF, Conn, H, HF>(
        &self,
        mut connect: C,
        mut handler: H,
        shutdown: CancellationToken,
    ) -> Result<(), FeedError>
    where
        C: FnMut() -> CF,
        CF: Future<Output = Result<Conn, FeedError>>,
        H: FnMut(Conn) -> HF,
        HF: Future<Output = Result<(), FeedError>>,
    {
        let mut backoff = BackoffPolicy::new(self.policy);

        while !shutdown.is_cancelled() {
            let result = match connect().await {
                Ok(conn) => handler(conn).await,
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(()) => {
                    tracing::info!("Feed handler returned, supervisor exiting");
                    return Ok(());
                }
                Err(e) => e,
            };

            if shutdown.is_cancelled() {
                break;
            }
            if !error.is_transient() {
                tracing::error!(error = %error, "Non-recoverable feed error");
                return Err(error);
            }

            match backoff.on_failure(Instant::now()) {
                BackoffDecision::Escalate => {
                    let attempts = backoff.attempts();
                    tracing::error!(
                        attempts,
                        error = %error,
                        "Reached max consecutive feed errors, giving up"
                    );
                    return Err(FeedError::Escalated {
                        attempts,
                        last: Box::new(error),
                    });
                }
                BackoffDecision::Retry(cooldown) => {
                    if error.is_auth_rejected() {
                        tracing::error!(error = %error, "That looks bad, feed key rejected");
                    } else {
                        tracing::info!(
                            error = %error,
                            attempt = backoff.attempts(),
                            max = self.policy.max_attempts,
                            cooldown_secs = cooldown.as_secs(),
                            "Transient feed error, sleeping before reconnect"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(cooldown) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!("Feed supervisor shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            reset_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(60),
        }
    }

    // ── BackoffPolicy arithmetic ────────────────────────────────────

    #[test]
    fn escalates_on_third_consecutive_failure() {
        let mut backoff = BackoffPolicy::new(fast_policy());
        let t0 = Instant::now();

        assert_eq!(
            backoff.on_failure(t0),
            BackoffDecision::Retry(Duration::from_secs(60))
        );
        assert_eq!(
            backoff.on_failure(t0 + Duration::from_secs(10)),
            BackoffDecision::Retry(Duration::from_secs(60))
        );
        assert_eq!(
            backoff.on_failure(t0 + Duration::from_secs(20)),
            BackoffDecision::Escalate
        );
    }

    #[test]
    fn counter_resets_outside_window() {
        let mut backoff = BackoffPolicy::new(fast_policy());
        let t0 = Instant::now();

        backoff.on_failure(t0);
        backoff.on_failure(t0 + Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 2);

        // Third failure arrives well past the reset window: counter restarts.
        let decision = backoff.on_failure(t0 + Duration::from_secs(400));
        assert_eq!(decision, BackoffDecision::Retry(Duration::from_secs(60)));
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn failure_exactly_at_window_edge_still_counts() {
        let mut backoff = BackoffPolicy::new(fast_policy());
        let t0 = Instant::now();

        backoff.on_failure(t0);
        backoff.on_failure(t0 + Duration::from_secs(300));
        assert_eq!(backoff.attempts(), 2);
    }

    // ── Supervisor loop ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn escalates_after_max_transient_failures() {
        let supervisor = ReconnectSupervisor::new(fast_policy());
        let connects = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&connects);

        let result = supervisor
            .run(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(FeedError::Connect("refused".into())) }
                },
                |_conn: ()| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        match result {
            Err(FeedError::Escalated { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FeedError::Connect(_)));
            }
            other => panic!("expected escalation, got {other:?}"),
        }
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_propagates_without_retry() {
        let supervisor = ReconnectSupervisor::new(fast_policy());
        let connects = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&connects);

        let result = supervisor
            .run(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                |_conn: ()| async { Err(FeedError::Protocol("bad frame".into())) },
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(FeedError::Protocol(_))));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_handler_return_exits_ok() {
        let supervisor = ReconnectSupervisor::new(fast_policy());
        let result = supervisor
            .run(
                || async { Ok(()) },
                |_conn: ()| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff_sleep() {
        let supervisor = ReconnectSupervisor::new(fast_policy());
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();

        let run = tokio::spawn(async move {
            supervisor
                .run(
                    || async { Err::<(), _>(FeedError::Disconnected("reset".into())) },
                    |_conn: ()| async { Ok(()) },
                    shutdown,
                )
                .await
        });

        // Let the first failure land and the cooldown sleep begin.
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();

        let result = run.await.unwrap();
        assert!(result.is_ok(), "shutdown should not re-raise: {result:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_follows_same_arithmetic() {
        let supervisor = ReconnectSupervisor::new(fast_policy());
        let result = supervisor
            .run(
                || async {
                    Err::<(), _>(FeedError::AuthRejected {
                        status: 403,
                        reason: "bad key".into(),
                    })
                },
                |_conn: ()| async { Ok(()) },
                CancellationToken::new(),
            )
            .await;

        match result {
            Err(FeedError::Escalated { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_auth_rejected());
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }
}

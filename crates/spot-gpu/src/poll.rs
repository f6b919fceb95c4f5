//! Cancellable polling shared by every wait loop.
//!
//! A poll runs a check on a fixed interval until the check reports done, the
//! limit (attempt count or deadline) is reached, or the cancellation token
//! fires. Fatal conditions are expressed by the check returning
//! `PollStep::Done(Err(..))`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// When a poll gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollLimit {
    /// Stop after this many checks.
    Attempts(u32),
    /// Stop once this much time has elapsed since the first check.
    Deadline(Duration),
}

/// Interval and limit of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between checks.
    pub interval: Duration,
    /// Stop condition.
    pub limit: PollLimit,
}

impl PollPolicy {
    /// Poll at most `max_attempts` times.
    #[must_use]
    pub fn attempts(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            limit: PollLimit::Attempts(max_attempts),
        }
    }

    /// Poll until `bound` has elapsed.
    #[must_use]
    pub fn deadline(interval: Duration, bound: Duration) -> Self {
        Self {
            interval,
            limit: PollLimit::Deadline(bound),
        }
    }
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    /// Terminal condition reached.
    Done(T),
    /// Not yet; check again on the next tick.
    Pending,
}

/// Result of a whole poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check reported done.
    Ready {
        /// Value returned by the check.
        value: T,
        /// Checks performed, including the final one.
        attempts: u32,
    },
    /// The limit was reached while still pending.
    Exhausted {
        /// Checks performed.
        attempts: u32,
        /// Time spent polling.
        elapsed: Duration,
    },
    /// The cancellation token fired.
    Cancelled {
        /// Checks performed.
        attempts: u32,
        /// Time spent polling.
        elapsed: Duration,
    },
}

/// Run `check` under `policy` until it is done, exhausted or cancelled.
///
/// `check` receives the 1-based attempt number. An in-flight check is
/// dropped when the token fires.
pub async fn poll<T, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut check: F,
) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PollStep<T>>,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled {
                attempts: attempt,
                elapsed: start.elapsed(),
            };
        }

        attempt += 1;
        let step = tokio::select! {
            () = cancel.cancelled() => {
                return PollOutcome::Cancelled {
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            step = check(attempt) => step,
        };

        if let PollStep::Done(value) = step {
            return PollOutcome::Ready {
                value,
                attempts: attempt,
            };
        }

        let elapsed = start.elapsed();
        let delay = match policy.limit {
            PollLimit::Attempts(max) if attempt >= max => None,
            PollLimit::Attempts(_) => Some(policy.interval),
            PollLimit::Deadline(bound) if elapsed >= bound => None,
            PollLimit::Deadline(bound) => Some(policy.interval.min(bound - elapsed)),
        };

        let Some(delay) = delay else {
            debug!(operation = operation_name, attempts = attempt, "Poll limit reached");
            return PollOutcome::Exhausted {
                attempts: attempt,
                elapsed,
            };
        };

        debug!(
            operation = operation_name,
            attempt,
            elapsed_secs = elapsed.as_secs(),
            "Still pending, next check in {delay:?}"
        );

        tokio::select! {
            () = cancel.cancelled() => {
                return PollOutcome::Cancelled {
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_attempt() {
        let policy = PollPolicy::attempts(Duration::from_secs(15), 10);
        let cancel = CancellationToken::new();

        let outcome = poll(&policy, &cancel, "test", |attempt| async move {
            if attempt == 3 {
                PollStep::Done("ok")
            } else {
                PollStep::Pending
            }
        })
        .await;

        assert_eq!(
            outcome,
            PollOutcome::Ready {
                value: "ok",
                attempts: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_limit() {
        let policy = PollPolicy::attempts(Duration::from_secs(15), 4);
        let cancel = CancellationToken::new();

        let outcome: PollOutcome<()> =
            poll(&policy, &cancel, "test", |_| async { PollStep::Pending }).await;

        match outcome {
            PollOutcome::Exhausted { attempts, elapsed } => {
                assert_eq!(attempts, 4);
                assert_eq!(elapsed, Duration::from_secs(45));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_limit() {
        let policy = PollPolicy::deadline(Duration::from_secs(30), Duration::from_secs(100));
        let cancel = CancellationToken::new();

        let outcome: PollOutcome<()> =
            poll(&policy, &cancel, "test", |_| async { PollStep::Pending }).await;

        match outcome {
            // checks at 0, 30, 60, 90 and a final one at 100
            PollOutcome::Exhausted { attempts, elapsed } => {
                assert_eq!(attempts, 5);
                assert_eq!(elapsed, Duration::from_secs(100));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep() {
        let policy = PollPolicy::attempts(Duration::from_secs(60), 100);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });

        let outcome: PollOutcome<()> =
            poll(&policy, &cancel, "test", |_| async { PollStep::Pending }).await;

        match outcome {
            PollOutcome::Cancelled { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_never_checks() {
        let policy = PollPolicy::attempts(Duration::from_secs(1), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut calls = 0;
        let outcome: PollOutcome<()> = poll(&policy, &cancel, "test", |_| {
            calls += 1;
            async { PollStep::Pending }
        })
        .await;

        assert!(matches!(outcome, PollOutcome::Cancelled { attempts: 0, .. }));
        assert_eq!(calls, 0);
    }
}

//! Stage invocation with deadlines, retries, and circuit breakers.
//!
//! Every external stage call goes through [`StageRunner::run`]: the breaker
//! is consulted first, each attempt races its deadline, retryable failures
//! back off with jitter, and every failure is recorded in the ledger. A
//! retryable error that survives all attempts is promoted to `Permanent`.

pub mod breaker;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::StagePolicies;
use crate::errors::{ErrorKind, StageError, StageResult};
use crate::recovery::{backoff_delay, is_retryable, FailureLedger};

pub use breaker::{BreakerRegistry, CircuitState};

/// Absolute cutoff for a stage call. `never()` means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn never() -> Self {
        Self { at: None }
    }

    pub fn within(duration: Duration) -> Self {
        Self {
            at: Some(Instant::now() + duration),
        }
    }

    /// The earlier of two deadlines; a group-level deadline clamps per-stage
    /// deadlines this way.
    pub fn clamp(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline { at: Some(a.min(b)) },
            (Some(a), None) => Deadline { at: Some(a) },
            (None, b) => Deadline { at: b },
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }
}

/// Result of one stage invocation as seen by the orchestrator.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok(T),
    Failed(StageError),
    /// The call was refused (open breaker, expired deadline) without
    /// reaching the collaborator; the group is left unchanged.
    Skipped(String),
}

impl<T> StageOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, StageOutcome::Ok(_))
    }
}

pub struct StageRunner {
    policies: StagePolicies,
    breakers: Arc<BreakerRegistry>,
    ledger: FailureLedger,
}

impl StageRunner {
    pub fn new(policies: StagePolicies, breakers: Arc<BreakerRegistry>, ledger: FailureLedger) -> Self {
        Self {
            policies,
            breakers,
            ledger,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Invoke `op` under the subsystem's retry policy and breaker. `op` is
    /// called once per attempt.
    pub async fn run<T, F, Fut>(
        &self,
        subsystem: &str,
        deadline: Deadline,
        op: F,
    ) -> StageOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StageResult<T>>,
    {
        let policy = self.policies.for_subsystem(subsystem).clone();

        if !self.breakers.try_admit(subsystem) {
            let error = StageError::new(
                ErrorKind::CircuitOpen,
                format!("circuit open for {subsystem}"),
            );
            self.ledger.record(subsystem, &error);
            return StageOutcome::Skipped(error.message);
        }

        let mut last_error: Option<StageError> = None;
        for attempt in 0..policy.max_attempts {
            if deadline.is_expired() {
                let error = StageError::timeout(format!(
                    "{subsystem} deadline exceeded before attempt {}",
                    attempt + 1
                ));
                self.ledger.record(subsystem, &error);
                if attempt == 0 {
                    // Never reached the collaborator; retry on a later tick.
                    return StageOutcome::Skipped(error.message);
                }
                return StageOutcome::Failed(exhausted(subsystem, attempt, error));
            }

            let result = match deadline.remaining() {
                Some(remaining) => match tokio::time::timeout(remaining, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::timeout(format!(
                        "{subsystem} attempt {} hit deadline",
                        attempt + 1
                    ))),
                },
                None => op().await,
            };

            match result {
                Ok(value) => {
                    self.breakers.on_success(subsystem);
                    if attempt > 0 {
                        debug!(subsystem, attempt = attempt + 1, "stage succeeded after retry");
                    }
                    return StageOutcome::Ok(value);
                }
                Err(error) => {
                    self.ledger.record(subsystem, &error);
                    self.breakers.on_failure(subsystem);

                    if !is_retryable(&error) {
                        warn!(subsystem, kind = %error.kind, "stage failed permanently: {}", error.message);
                        return StageOutcome::Failed(error);
                    }
                    let is_last = attempt + 1 == policy.max_attempts;
                    if is_last {
                        return StageOutcome::Failed(exhausted(subsystem, attempt + 1, error));
                    }

                    let mut delay = backoff_delay(&policy, attempt);
                    if let Some(remaining) = deadline.remaining() {
                        delay = delay.min(remaining);
                    }
                    warn!(
                        subsystem,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        "transient stage failure, retrying: {}",
                        error.message
                    );
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts == 0 is a config degenerate; surface it as permanent.
        StageOutcome::Failed(last_error.unwrap_or_else(|| {
            StageError::permanent(format!("{subsystem} ran out of attempts"))
        }))
    }
}

/// Retryable error that survived every attempt; permanent for this group.
fn exhausted(subsystem: &str, attempts: u32, error: StageError) -> StageError {
    StageError::new(
        ErrorKind::Permanent,
        format!(
            "{subsystem} failed after {attempts} attempt(s): {}: {}",
            error.kind, error.message
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagePolicy;
    use crate::store::StateStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn runner_with(policies: StagePolicies) -> (StageRunner, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(&tmp.path().join("state.sqlite3")).unwrap());
        let breakers = Arc::new(BreakerRegistry::new(policies.clone()));
        let runner = StageRunner::new(policies, breakers, FailureLedger::new(store));
        (runner, tmp)
    }

    fn fast_policies() -> StagePolicies {
        let fast = StagePolicy {
            base_delay_secs: 0.0,
            max_delay_secs: 0.0,
            jitter: false,
            ..StagePolicy::default()
        };
        StagePolicies {
            calibration_solve: fast.clone(),
            imaging: StagePolicy {
                failure_threshold: 5,
                max_attempts: 2,
                ..fast.clone()
            },
            mosaicking: fast.clone(),
            photometry: fast,
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let (runner, _tmp) = runner_with(fast_policies());
        let calls = AtomicU32::new(0);
        let outcome = runner
            .run("calibration_solve", Deadline::never(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(StageError::transient("table busy"))
                } else {
                    Ok(42u32)
                }
            })
            .await;
        assert!(matches!(outcome, StageOutcome::Ok(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_fails_without_retry() {
        let (runner, _tmp) = runner_with(fast_policies());
        let calls = AtomicU32::new(0);
        let outcome: StageOutcome<()> = runner
            .run("calibration_solve", Deadline::never(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StageError::validation("bad field selection"))
            })
            .await;
        match outcome {
            StageOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::Validation),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_become_permanent() {
        let (runner, _tmp) = runner_with(fast_policies());
        let outcome: StageOutcome<()> = runner
            .run("imaging", Deadline::never(), || async {
                Err(StageError::transient("I/O error"))
            })
            .await;
        match outcome {
            StageOutcome::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::Permanent);
                assert!(err.message.contains("after 2 attempt"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_breaker_skips_without_calling() {
        let (runner, _tmp) = runner_with(fast_policies());
        // Imaging breaker threshold is 5; two runs of 2 attempts each plus
        // one more run trip it.
        for _ in 0..3 {
            let _: StageOutcome<()> = runner
                .run("imaging", Deadline::never(), || async {
                    Err(StageError::transient("I/O error"))
                })
                .await;
        }
        let calls = AtomicU32::new(0);
        let outcome: StageOutcome<()> = runner
            .run("imaging", Deadline::never(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "collaborator must not be invoked");
    }

    #[tokio::test]
    async fn expired_deadline_skips_before_first_attempt() {
        let (runner, _tmp) = runner_with(fast_policies());
        let deadline = Deadline::within(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let calls = AtomicU32::new(0);
        let outcome: StageOutcome<()> = runner
            .run("mosaicking", deadline, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deadline_clamp_takes_earlier() {
        let short = Deadline::within(Duration::from_secs(1));
        let long = Deadline::within(Duration::from_secs(3600));
        let clamped = long.clamp(short);
        assert!(clamped.remaining().unwrap() <= Duration::from_secs(1));
        assert!(Deadline::never().clamp(Deadline::never()).remaining().is_none());
    }
}

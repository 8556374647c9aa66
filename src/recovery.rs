//! Failure classification, backoff, and the persisted failure ledger.
//!
//! Transient failures are retried with exponential backoff and jitter;
//! permanent ones fail the group on first occurrence. Every failure lands in
//! the ledger so breakers and operators can reason about recent history
//! without digging through stage logs.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::StagePolicy;
use crate::errors::{ErrorKind, StageError};
use crate::models::FailureEvent;
use crate::store::{now_ts, StateStore};

/// Ledger rows older than this are pruned.
pub const LEDGER_RETENTION_SECS: i64 = 24 * 3600;

/// Message fragments that mark an error as retryable regardless of kind.
const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "i/o",
    "disk",
    "temporary",
    "resource",
    "busy",
    "locked",
];

/// An error is retryable iff its kind declares so or its message carries a
/// transient signature.
pub fn is_retryable(error: &StageError) -> bool {
    if error.kind.is_retryable() {
        return true;
    }
    if error.kind == ErrorKind::Timeout {
        return true;
    }
    let message = error.message.to_lowercase();
    TRANSIENT_KEYWORDS.iter().any(|kw| message.contains(kw))
}

/// Backoff delay for a zero-based attempt index:
/// `min(max_delay, base * exp^attempt)` with multiplicative jitter in
/// [0.5, 1.5].
pub fn backoff_delay(policy: &StagePolicy, attempt: u32) -> Duration {
    let exp = policy.exponential_base.powi(attempt as i32);
    let mut delay = (policy.base_delay_secs * exp).min(policy.max_delay_secs);
    if policy.jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        delay *= factor;
    }
    Duration::from_secs_f64(delay.max(0.0))
}

/// Persisted record of recent failures per subsystem.
#[derive(Clone)]
pub struct FailureLedger {
    store: Arc<StateStore>,
}

impl FailureLedger {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, subsystem: &str, error: &StageError) {
        let event = FailureEvent {
            subsystem: subsystem.to_string(),
            error_kind: error.kind,
            message: error.message.clone(),
            ts: now_ts(),
        };
        if let Err(e) = self.store.record_failure(&event) {
            warn!(subsystem, "failed to record failure event: {e}");
        }
    }

    pub fn failures_within(&self, subsystem: &str, window_secs: i64) -> u32 {
        self.store
            .failures_since(subsystem, now_ts() - window_secs)
            .unwrap_or(0)
    }

    /// Drop events outside the retention window.
    pub fn prune(&self) -> usize {
        self.store
            .prune_failures_before(now_ts() - LEDGER_RETENTION_SECS)
            .unwrap_or(0)
    }

    pub fn recent(&self, limit: usize) -> Vec<FailureEvent> {
        self.store.recent_failures(limit).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_classification() {
        for message in [
            "Timeout waiting for table lock",
            "connection reset by peer",
            "I/O error on device",
            "disk quota exceeded",
            "resource temporarily unavailable",
            "database is locked",
        ] {
            assert!(
                is_retryable(&StageError::permanent(message)),
                "{message} should be retryable"
            );
        }
        assert!(!is_retryable(&StageError::permanent("bad antenna table")));
        assert!(!is_retryable(&StageError::validation("wrong shape")));
    }

    #[test]
    fn kind_classification_overrides_message() {
        assert!(is_retryable(&StageError::transient("anything")));
        assert!(is_retryable(&StageError::new(
            ErrorKind::Resource,
            "quota"
        )));
        assert!(is_retryable(&StageError::timeout("deadline")));
        assert!(!is_retryable(&StageError::new(
            ErrorKind::MissingTable,
            "no bpcal"
        )));
    }

    #[test]
    fn backoff_growth_and_cap() {
        let policy = StagePolicy {
            base_delay_secs: 5.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
            jitter: false,
            ..StagePolicy::default()
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(20));
        // Capped.
        assert_eq!(backoff_delay(&policy, 10), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = StagePolicy {
            base_delay_secs: 10.0,
            max_delay_secs: 600.0,
            exponential_base: 2.0,
            jitter: true,
            ..StagePolicy::default()
        };
        for _ in 0..100 {
            let delay = backoff_delay(&policy, 0).as_secs_f64();
            assert!((5.0..15.0).contains(&delay), "delay={delay}");
        }
    }
}

//! Shard attempt policy: which failures get another worker, and how soon.

use std::time::Duration;

use crate::wire::WireError;

/// High-level classification of a shard failure for reassignment purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardErrorKind {
    /// The assignment deadline or a stream idle timeout elapsed.
    Timeout,
    /// The worker was unreachable or dropped the connection.
    Connection,
    /// The worker reported a transcode failure.
    WorkerReported,
    /// Anything else (typically not retried).
    Other,
}

impl ShardErrorKind {
    /// Only transient failures earn the shard another worker.
    pub fn is_transient(self) -> bool {
        !matches!(self, ShardErrorKind::Other)
    }
}

/// Maps a transport error to a retry classification.
pub fn classify_wire(err: &WireError) -> ShardErrorKind {
    match err {
        WireError::IdleTimeout(_) => ShardErrorKind::Timeout,
        WireError::Closed | WireError::Io(_) => ShardErrorKind::Connection,
        WireError::Protocol(_) | WireError::Json(_) | WireError::ChunkTooLarge(_) => {
            ShardErrorKind::WorkerReported
        }
    }
}

/// Decision returned by the attempt policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Give up; the job fails with `failed:shard-exhausted`.
    NoRetry,
    /// Reassign to a different worker after the given delay.
    RetryAfter(Duration),
}

/// Bounded attempts with a delay that doubles per failed attempt.
/// Rotation to a different worker is the board's job; this only decides
/// whether and when.
#[derive(Debug, Clone, Copy)]
pub struct AttemptPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Ceiling the doubling saturates at.
    pub max_delay: Duration,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl AttemptPolicy {
    /// Decide the fate of a shard whose `attempt` (1-based) just failed
    /// with `kind`.
    pub fn decide(&self, attempt: u32, kind: ShardErrorKind) -> AttemptDecision {
        if !kind.is_transient() || attempt >= self.max_attempts {
            return AttemptDecision::NoRetry;
        }
        AttemptDecision::RetryAfter(self.backoff(attempt))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kind_never_retries() {
        let p = AttemptPolicy::default();
        assert_eq!(p.decide(1, ShardErrorKind::Other), AttemptDecision::NoRetry);
    }

    #[test]
    fn delay_doubles_per_failed_attempt() {
        let p = AttemptPolicy {
            max_attempts: 6,
            ..AttemptPolicy::default()
        };
        assert_eq!(
            p.decide(1, ShardErrorKind::Timeout),
            AttemptDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            p.decide(2, ShardErrorKind::Connection),
            AttemptDecision::RetryAfter(Duration::from_millis(400))
        );
        assert_eq!(
            p.decide(3, ShardErrorKind::WorkerReported),
            AttemptDecision::RetryAfter(Duration::from_millis(800))
        );
    }

    #[test]
    fn delay_saturates_at_ceiling() {
        let p = AttemptPolicy {
            max_attempts: 40,
            ..AttemptPolicy::default()
        };
        assert_eq!(
            p.decide(39, ShardErrorKind::Timeout),
            AttemptDecision::RetryAfter(p.max_delay)
        );
    }

    #[test]
    fn attempt_budget_is_inclusive_of_the_first() {
        let p = AttemptPolicy::default();
        assert!(matches!(
            p.decide(2, ShardErrorKind::WorkerReported),
            AttemptDecision::RetryAfter(_)
        ));
        assert_eq!(
            p.decide(3, ShardErrorKind::WorkerReported),
            AttemptDecision::NoRetry
        );
    }

    #[test]
    fn wire_errors_classify_transient() {
        for err in [
            WireError::Closed,
            WireError::IdleTimeout(Duration::from_secs(1)),
            WireError::Protocol("bad frame".to_string()),
            WireError::ChunkTooLarge(u64::MAX),
        ] {
            assert!(classify_wire(&err).is_transient(), "{err}");
        }
        assert_eq!(
            classify_wire(&WireError::IdleTimeout(Duration::from_secs(1))),
            ShardErrorKind::Timeout
        );
        assert_eq!(
            classify_wire(&WireError::Closed),
            ShardErrorKind::Connection
        );
    }
}

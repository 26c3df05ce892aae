//! Retry/backoff policy
//!
//! Pure decision function mapping a failed execution to either a retry delay
//! or a dead-letter verdict. Only failures of the job's own execution reach
//! this policy; transient store errors are retried by the poll loop and
//! never consume a job attempt.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            factor: 2,
        }
    }
}

/// Verdict for a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay
    Retry { delay: Duration },
    /// Attempts exhausted; the job moves to `dead` and never retries
    DeadLetter,
}

impl RetryPolicy {
    /// Decides the fate of a job whose execution just failed.
    ///
    /// `attempt_count` is the count including the failure being recorded, so
    /// the job dead-letters exactly when it reaches `max_attempts`.
    pub fn decide(&self, attempt_count: i32, max_attempts: i32) -> RetryDecision {
        if attempt_count >= max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.delay_for(attempt_count),
            }
        }
    }

    /// Delay before the next attempt: `base * factor^(attempt - 1)`, capped,
    /// with jitter drawn uniformly from the upper half of the interval so
    /// simultaneous failures do not reclaim in lockstep.
    fn delay_for(&self, attempt_count: i32) -> Duration {
        let exp = attempt_count.saturating_sub(1).clamp(0, 63) as u32;
        let factor = u64::from(self.factor).checked_pow(exp).unwrap_or(u64::MAX);
        let base_ms = self.base_delay.as_millis() as u64;
        let capped_ms = base_ms
            .saturating_mul(factor)
            .min(self.max_delay.as_millis() as u64);

        let jittered = (capped_ms as f64 * rand::thread_rng().gen_range(0.5..=1.0)) as u64;
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            factor: 2,
        }
    }

    fn retry_delay(policy: &RetryPolicy, attempt: i32) -> Duration {
        match policy.decide(attempt, i32::MAX) {
            RetryDecision::Retry { delay } => delay,
            RetryDecision::DeadLetter => panic!("expected a retry"),
        }
    }

    #[test]
    fn test_dead_letter_exactly_at_max_attempts() {
        let policy = policy();
        assert!(matches!(
            policy.decide(2, 3),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(policy.decide(3, 3), RetryDecision::DeadLetter);
        assert_eq!(policy.decide(4, 3), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_delay_grows_exponentially_within_jitter_bounds() {
        let policy = policy();
        for _ in 0..100 {
            let first = retry_delay(&policy, 1);
            assert!(first >= Duration::from_millis(2_500), "got {first:?}");
            assert!(first <= Duration::from_secs(5), "got {first:?}");

            let third = retry_delay(&policy, 3);
            assert!(third >= Duration::from_secs(10), "got {third:?}");
            assert!(third <= Duration::from_secs(20), "got {third:?}");
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy();
        for _ in 0..100 {
            let delay = retry_delay(&policy, 30);
            assert!(delay <= Duration::from_secs(600));
            assert!(delay >= Duration::from_secs(300));
        }
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let policy = policy();
        let delay = retry_delay(&policy, i32::MAX - 1);
        assert!(delay <= Duration::from_secs(600));
    }

    #[test]
    fn test_zero_base_produces_immediate_retry() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy()
        };
        assert_eq!(
            policy.decide(1, 3),
            RetryDecision::Retry {
                delay: Duration::ZERO
            }
        );
    }
}

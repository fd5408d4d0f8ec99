//! Stateless retry decisions for failed step attempts.

use chrono::{DateTime, Utc};
use conduit_types::error::ErrorKind;
use conduit_types::workflow::RetryPolicy;

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the step at `next_attempt_at`.
    RetryAt { next_attempt_at: DateTime<Utc> },
    /// Attempts exhausted, or the failure kind is not retryable.
    GiveUp,
}

/// Stateless retry handler. All logic lives in associated functions that
/// take the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// `attempt` is 1-based: the number of the attempt that just failed.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt < policy.max_attempts
    }

    pub fn decide(
        policy: &RetryPolicy,
        attempt: u32,
        kind: ErrorKind,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !Self::should_retry(policy, attempt, kind) {
            return RetryDecision::GiveUp;
        }
        let delay = policy.backoff.delay(attempt);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        RetryDecision::RetryAt {
            next_attempt_at: now + delay,
        }
    }

    /// Time left until `next_attempt_at`, zero if it has passed.
    pub fn remaining_delay(next_attempt_at: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
        (next_attempt_at - now).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::workflow::Backoff;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff {
                initial_ms: 100,
                multiplier: 2.0,
                max_ms: 250,
            },
        }
    }

    #[test]
    fn retries_until_max_attempts() {
        let p = policy(3);
        assert!(RetryHandler::should_retry(&p, 1, ErrorKind::StepError));
        assert!(RetryHandler::should_retry(&p, 2, ErrorKind::StepTimeout));
        assert!(!RetryHandler::should_retry(&p, 3, ErrorKind::StepError));
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        assert!(!RetryHandler::should_retry(&RetryPolicy::no_retry(), 1, ErrorKind::StepError));
    }

    #[test]
    fn non_retryable_kinds_give_up() {
        let now = Utc::now();
        assert_eq!(
            RetryHandler::decide(&policy(5), 1, ErrorKind::DependencyFailure, now),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn decide_schedules_capped_backoff() {
        let now = Utc::now();
        let p = policy(5);

        let RetryDecision::RetryAt { next_attempt_at } =
            RetryHandler::decide(&p, 1, ErrorKind::StepError, now)
        else {
            panic!("expected retry");
        };
        assert_eq!((next_attempt_at - now).num_milliseconds(), 100);

        let RetryDecision::RetryAt { next_attempt_at } =
            RetryHandler::decide(&p, 3, ErrorKind::ExecutorCrash, now)
        else {
            panic!("expected retry");
        };
        assert_eq!((next_attempt_at - now).num_milliseconds(), 250, "capped at max_ms");
    }

    #[test]
    fn remaining_delay_never_negative() {
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(5);
        assert_eq!(RetryHandler::remaining_delay(past, now), std::time::Duration::ZERO);

        let future = now + chrono::Duration::milliseconds(40);
        assert_eq!(
            RetryHandler::remaining_delay(future, now),
            std::time::Duration::from_millis(40)
        );
    }
}

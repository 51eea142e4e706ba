//! Retry policy: a pure mapping from attempt count and failure kind to the
//! next action. The dispatch worker consults it after every failed publish.

use crate::model::FailureKind;
use chrono::Duration;
use rand::Rng;

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch after the given delay.
    Retry(Duration),
    /// Give up; the item is terminally failed.
    Terminal,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_secs: i64,
    pub cap_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: 60,
            cap_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_secs: i64, cap_secs: i64) -> Self {
        Self { base_secs, cap_secs }
    }

    /// Un-jittered backoff curve: `base * 2^retry_count`, capped. Kept
    /// separate from `next_attempt` so the curve itself is testable.
    pub fn backoff_delay(&self, retry_count: i32) -> Duration {
        let shift = retry_count.clamp(0, 30) as u32;
        let secs = self
            .base_secs
            .saturating_mul(1_i64 << shift)
            .min(self.cap_secs);
        Duration::seconds(secs)
    }

    /// Decide what happens after a failed attempt. Permanent failures are
    /// always terminal. Transient failures retry with capped exponential
    /// backoff plus jitter in `[0, base)` until the attempt budget is spent.
    pub fn next_attempt(&self, retry_count: i32, max_retries: i32, kind: FailureKind) -> RetryDecision {
        match kind {
            FailureKind::Permanent => RetryDecision::Terminal,
            FailureKind::Transient if retry_count >= max_retries => RetryDecision::Terminal,
            FailureKind::Transient => {
                let jitter = rand::thread_rng().gen_range(0..self.base_secs.max(1));
                RetryDecision::Retry(self.backoff_delay(retry_count) + Duration::seconds(jitter))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0).num_seconds(), 60);
        assert_eq!(policy.backoff_delay(1).num_seconds(), 120);
        assert_eq!(policy.backoff_delay(2).num_seconds(), 240);
        assert_eq!(policy.backoff_delay(6).num_seconds(), 3600);
        assert_eq!(policy.backoff_delay(60).num_seconds(), 3600);
    }

    #[test]
    fn backoff_is_monotonic() {
        let policy = RetryPolicy::new(30, 1800);
        for n in 0..20 {
            assert!(policy.backoff_delay(n + 1) >= policy.backoff_delay(n));
        }
    }

    #[test]
    fn permanent_is_always_terminal() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_attempt(0, 3, FailureKind::Permanent),
            RetryDecision::Terminal
        );
    }

    #[test]
    fn transient_retries_until_budget_spent() {
        let policy = RetryPolicy::default();
        for n in 0..3 {
            assert!(matches!(
                policy.next_attempt(n, 3, FailureKind::Transient),
                RetryDecision::Retry(_)
            ));
        }
        assert_eq!(
            policy.next_attempt(3, 3, FailureKind::Transient),
            RetryDecision::Terminal
        );
    }

    #[test]
    fn jittered_delay_stays_within_base_of_curve() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let RetryDecision::Retry(delay) = policy.next_attempt(2, 5, FailureKind::Transient)
            else {
                panic!("expected retry");
            };
            let bare = policy.backoff_delay(2);
            assert!(delay >= bare);
            assert!(delay < bare + Duration::seconds(policy.base_secs));
        }
    }
}

//! Budget-gated retry with exponential backoff.
//!
//! Wraps an invocation-like future factory: before every attempt the
//! caller-supplied budget predicate is consulted with the calls that are
//! pending against the budget (calls consumed by earlier failed attempts
//! plus the attempt about to run), so a flapping backend can never
//! silently exceed the intended spend.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, RetryError};

/// Process-wide spend state for one evaluation run.
///
/// Owned exclusively by the orchestrator; the retry primitive only ever
/// sees it through a pure predicate closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum USD spend per run.
    pub max_cost: f64,
    /// Maximum backend calls per run.
    pub max_calls: u32,
    /// Running spend. Monotonically non-decreasing.
    pub spent_cost: f64,
    /// Running call count. Monotonically non-decreasing.
    pub spent_calls: u32,
}

impl Budget {
    /// Creates a fresh budget with nothing spent.
    pub fn new(max_cost: f64, max_calls: u32) -> Self {
        Self {
            max_cost,
            max_calls,
            spent_cost: 0.0,
            spent_calls: 0,
        }
    }

    /// Records spend from a completed invocation or failed attempt.
    pub fn record(&mut self, cost: f64, calls: u32) {
        self.spent_cost += cost.max(0.0);
        self.spent_calls += calls;
    }

    /// Returns true when the budget cannot cover `pending_calls` more calls.
    pub fn exceeded(&self, pending_calls: u32) -> bool {
        self.spent_cost >= self.max_cost || self.spent_calls + pending_calls >= self.max_calls
    }
}

/// Retry behavior: attempt count and backoff shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base for the exponential delay (seconds).
    pub backoff_base: f64,
    /// Upper bound of the uniform jitter added to each delay (seconds).
    pub backoff_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            backoff_jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.powi(attempt as i32).max(0.0);
        let jitter = if self.backoff_jitter > 0.0 {
            rand::rng().random_range(0.0..self.backoff_jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(base + jitter)
    }
}

/// Results that can account for backend calls consumed on their behalf.
///
/// Implemented by [`crate::invoke::InvocationResult`]; the retry wrapper
/// folds the consumption of failed attempts into the eventual success so
/// the caller's running totals stay accurate.
pub trait CallAccounting {
    /// Calls this result accounts for.
    fn calls(&self) -> u32;
    /// Adds calls consumed by failed attempts that preceded this result.
    fn add_calls(&mut self, n: u32);
}

/// Runs `attempt_fn` under the retry policy, gated by `budget_check`.
///
/// `budget_check` receives the pending call count: calls already consumed
/// by failed attempts in this session (not yet visible in the caller's
/// totals) plus the anticipated consumption of the attempt about to run.
/// Configuration errors re-raise immediately without a retry slot or a
/// sleep. The returned error always carries the cumulative consumed-call
/// count.
pub async fn run_with_retry<T, F, Fut, B>(
    mut attempt_fn: F,
    budget_check: B,
    policy: &RetryPolicy,
) -> std::result::Result<T, RetryError>
where
    T: CallAccounting,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    B: Fn(u32) -> bool,
{
    let mut consumed: u32 = 0;
    let mut next_estimate: u32 = 1;
    let mut last_err: Option<Error> = None;

    for attempt in 0..=policy.max_retries {
        let pending = consumed + next_estimate;
        if budget_check(pending) {
            return Err(RetryError {
                consumed_calls: consumed,
                source: Error::BudgetExceeded {
                    pending_calls: pending,
                },
            });
        }

        match attempt_fn().await {
            Ok(mut result) => {
                if consumed > 0 {
                    result.add_calls(consumed);
                }
                return Ok(result);
            }
            Err(e) if e.is_config() => {
                return Err(RetryError {
                    consumed_calls: consumed + e.calls_consumed(),
                    source: e,
                });
            }
            Err(e) => {
                let burned = e.calls_consumed();
                consumed += burned;
                next_estimate = burned.max(1);
                tracing::debug!(
                    attempt,
                    consumed,
                    error = %e,
                    "transient invocation failure"
                );
                last_err = Some(e);
                if attempt < policy.max_retries {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(RetryError {
        consumed_calls: consumed,
        source: last_err.expect("at least one attempt ran"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    struct Outcome {
        calls: u32,
    }

    impl CallAccounting for Outcome {
        fn calls(&self) -> u32 {
            self.calls
        }
        fn add_calls(&mut self, n: u32) {
            self.calls += n;
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: 2.0,
            backoff_jitter: 0.0,
        }
    }

    #[test]
    fn budget_records_monotonically() {
        let mut budget = Budget::new(5.0, 100);
        budget.record(0.25, 1);
        budget.record(0.50, 2);
        assert!((budget.spent_cost - 0.75).abs() < 1e-12);
        assert_eq!(budget.spent_calls, 3);
    }

    #[test]
    fn budget_exceeded_counts_pending_calls() {
        let mut budget = Budget::new(5.0, 5);
        budget.record(0.0, 4);
        assert!(!budget.exceeded(0));
        assert!(budget.exceeded(1));
        assert!(budget.exceeded(2));
    }

    #[test]
    fn budget_exceeded_on_cost() {
        let mut budget = Budget::new(1.0, 1000);
        budget.record(1.0, 1);
        assert!(budget.exceeded(0));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt_keeps_call_count() {
        let result = run_with_retry(
            || async { Ok(Outcome { calls: 1 }) },
            |_| false,
            &fast_policy(3),
        )
        .await
        .unwrap();
        assert_eq!(result.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_accumulates_calls() {
        let attempts = Cell::new(0u32);
        let result = run_with_retry(
            || {
                let n = attempts.get();
                attempts.set(n + 1);
                async move {
                    if n < 2 {
                        Err(Error::Transient {
                            reason: "flaky".to_string(),
                            calls: 1,
                        })
                    } else {
                        Ok(Outcome { calls: 1 })
                    }
                }
            },
            |_| false,
            &fast_policy(3),
        )
        .await
        .unwrap();

        assert_eq!(attempts.get(), 3);
        // 2 failed attempts + 1 success.
        assert_eq!(result.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn config_error_invokes_at_most_once() {
        let attempts = Cell::new(0u32);
        let err = run_with_retry(
            || {
                attempts.set(attempts.get() + 1);
                async { Err::<Outcome, _>(Error::Config("bad transport".to_string())) }
            },
            |_| false,
            &fast_policy(5),
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.get(), 1);
        assert!(err.source.is_config());
        assert_eq!(err.consumed_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_blocks_attempt_before_execution() {
        // max_calls = 5, each attempt consumes 2 calls. After two failed
        // attempts (4 consumed) the third is blocked before running.
        let mut budget = Budget::new(100.0, 5);
        let attempts = Cell::new(0u32);

        let err = {
            let budget_ref = &budget;
            run_with_retry(
                || {
                    attempts.set(attempts.get() + 1);
                    async {
                        Err::<Outcome, _>(Error::Transient {
                            reason: "double".to_string(),
                            calls: 2,
                        })
                    }
                },
                |pending| budget_ref.exceeded(pending),
                &fast_policy(5),
            )
            .await
            .unwrap_err()
        };

        assert_eq!(attempts.get(), 2);
        assert_eq!(err.consumed_calls, 4);
        assert!(matches!(err.source, Error::BudgetExceeded { .. }));
        budget.record(0.0, err.consumed_calls);
        assert_eq!(budget.spent_calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_carry_cumulative_calls() {
        let attempts = Cell::new(0u32);
        let err = run_with_retry(
            || {
                attempts.set(attempts.get() + 1);
                async {
                    Err::<Outcome, _>(Error::Transient {
                        reason: "down".to_string(),
                        calls: 1,
                    })
                }
            },
            |_| false,
            &fast_policy(2),
        )
        .await
        .unwrap_err();

        // 1 initial attempt + 2 retries.
        assert_eq!(attempts.get(), 3);
        assert_eq!(err.consumed_calls, 3);
        assert!(!err.source.is_config());
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = fast_policy(3);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_base: 2.0,
            backoff_jitter: 0.5,
        };
        for _ in 0..50 {
            let d = policy.delay_for(0).as_secs_f64();
            assert!((1.0..1.5).contains(&d));
        }
    }
}

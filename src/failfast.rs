//! Fail-fast detection for systemic backend outages.
//!
//! A run that hits the same error over and over is burning budget on an
//! outage, not on real test failures. The tracker fingerprints each
//! failure and signals the orchestrator to abort once the same fingerprint
//! repeats a configured number of times in a row. Interspersed successes
//! or differing errors reset the streak.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Longest message prefix kept in a fingerprint.
const FINGERPRINT_MESSAGE_CHARS: usize = 160;

/// Normalized signature of a failure: category plus truncated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureFingerprint {
    /// Error taxonomy category.
    pub category: String,
    /// Leading characters of the error message.
    pub message: String,
}

impl From<&Error> for FailureFingerprint {
    fn from(error: &Error) -> Self {
        let full = error.to_string();
        let message = if full.chars().count() > FINGERPRINT_MESSAGE_CHARS {
            full.chars().take(FINGERPRINT_MESSAGE_CHARS).collect()
        } else {
            full
        };
        Self {
            category: error.category().to_string(),
            message,
        }
    }
}

impl std::fmt::Display for FailureFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// Counts consecutive identical failures and fires at a threshold.
#[derive(Debug, Clone)]
pub struct ConsecutiveFailureTracker {
    threshold: u32,
    count: u32,
    last: Option<FailureFingerprint>,
}

impl ConsecutiveFailureTracker {
    /// Creates a tracker that fires after `threshold` identical failures.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            count: 0,
            last: None,
        }
    }

    /// Records a failure; returns true exactly when the threshold is hit.
    ///
    /// A failure with a different fingerprint than the previous one starts
    /// a fresh streak of length 1.
    pub fn record_failure(&mut self, error: &Error) -> bool {
        let fingerprint = FailureFingerprint::from(error);
        if self.last.as_ref() == Some(&fingerprint) {
            self.count += 1;
        } else {
            self.last = Some(fingerprint);
            self.count = 1;
        }
        self.threshold > 0 && self.count >= self.threshold
    }

    /// Records a success, resetting the streak.
    pub fn record_success(&mut self) {
        self.count = 0;
        self.last = None;
    }

    /// Resets all state; called at the start of each run iteration.
    pub fn reset(&mut self) {
        self.record_success();
    }

    /// The fingerprint of the current streak, if any.
    pub fn last_fingerprint(&self) -> Option<&FailureFingerprint> {
        self.last.as_ref()
    }

    /// Current streak length.
    pub fn streak(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_err() -> Error {
        Error::Timeout { seconds: 120 }
    }

    fn transient_err(reason: &str) -> Error {
        Error::Transient {
            reason: reason.to_string(),
            calls: 1,
        }
    }

    #[test]
    fn three_identical_failures_trigger() {
        let mut tracker = ConsecutiveFailureTracker::new(3);
        assert!(!tracker.record_failure(&timeout_err()));
        assert!(!tracker.record_failure(&timeout_err()));
        assert!(tracker.record_failure(&timeout_err()));
    }

    #[test]
    fn differing_fingerprints_never_trigger() {
        let mut tracker = ConsecutiveFailureTracker::new(3);
        assert!(!tracker.record_failure(&timeout_err()));
        assert!(!tracker.record_failure(&transient_err("rate limited")));
        assert!(!tracker.record_failure(&timeout_err()));
        assert_eq!(tracker.streak(), 1);
    }

    #[test]
    fn success_between_failures_resets_streak() {
        let mut tracker = ConsecutiveFailureTracker::new(2);
        assert!(!tracker.record_failure(&timeout_err()));
        tracker.record_success();
        assert!(!tracker.record_failure(&timeout_err()));
        assert!(tracker.record_failure(&timeout_err()));
    }

    #[test]
    fn reset_clears_state_between_run_iterations() {
        let mut tracker = ConsecutiveFailureTracker::new(2);
        tracker.record_failure(&timeout_err());
        tracker.reset();
        assert_eq!(tracker.streak(), 0);
        assert!(tracker.last_fingerprint().is_none());
        assert!(!tracker.record_failure(&timeout_err()));
    }

    #[test]
    fn same_category_different_message_is_a_new_streak() {
        let mut tracker = ConsecutiveFailureTracker::new(2);
        assert!(!tracker.record_failure(&transient_err("exit 1")));
        assert!(!tracker.record_failure(&transient_err("exit 2")));
        assert!(tracker.record_failure(&transient_err("exit 2")));
    }

    #[test]
    fn fingerprint_truncates_long_messages() {
        let long = "x".repeat(500);
        let err = transient_err(&long);
        let fp = FailureFingerprint::from(&err);
        assert_eq!(fp.message.chars().count(), 160);
        assert_eq!(fp.category, "transient");
    }

    #[test]
    fn last_fingerprint_reports_current_streak() {
        let mut tracker = ConsecutiveFailureTracker::new(5);
        tracker.record_failure(&timeout_err());
        let fp = tracker.last_fingerprint().unwrap();
        assert_eq!(fp.category, "timeout");
        assert!(fp.message.contains("120"));
    }
}

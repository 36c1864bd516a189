//! Whole-run budget and operator cancellation.
//!
//! A run stops at the next stage boundary once either its wall-clock budget
//! is exhausted or an operator has cancelled it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Whole-run limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBudget {
    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,
}

fn default_run_timeout() -> u64 {
    3600
} // 1 hour

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            run_timeout_seconds: default_run_timeout(),
        }
    }
}

impl RunBudget {
    pub fn limit(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }
}

/// Operator-side handle used to cancel one run
#[derive(Debug)]
pub struct Cancellation {
    tx: watch::Sender<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request cancellation (idempotent)
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver observed by the run's tracker
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Tracks the budget and cancellation state of a run in flight
#[derive(Debug, Clone)]
pub struct RunTracker {
    /// When the run started executing (queue time is not counted)
    started_at: Instant,

    limit: Duration,

    cancel: Option<watch::Receiver<bool>>,
}

impl RunTracker {
    /// Create a tracker; the budget clock starts now
    pub fn new(budget: &RunBudget, cancel: Option<watch::Receiver<bool>>) -> Self {
        Self {
            started_at: Instant::now(),
            limit: budget.limit(),
            cancel,
        }
    }

    /// A tracker with no time limit and no cancellation handle
    pub fn unbounded() -> Self {
        Self {
            started_at: Instant::now(),
            limit: Duration::MAX,
            cancel: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Check the run may start another stage
    pub fn check(&self) -> Result<(), BudgetViolation> {
        if self.is_cancelled() {
            return Err(BudgetViolation::Cancelled);
        }

        let elapsed = self.started_at.elapsed();
        if elapsed >= self.limit {
            return Err(BudgetViolation::RunTimeout {
                elapsed_seconds: elapsed.as_secs(),
                limit_seconds: self.limit.as_secs(),
            });
        }

        Ok(())
    }

    /// Time left in the budget
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started_at.elapsed())
    }

    /// Shorten a stage timeout so it cannot outlive the run budget
    pub fn clamp(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }
}

/// Reasons a run stops at a stage boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetViolation {
    #[error("Cancelled by operator")]
    Cancelled,

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget() {
        let budget = RunBudget::default();
        assert_eq!(budget.run_timeout_seconds, 3600);
        assert_eq!(budget.limit(), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let budget = RunBudget {
            run_timeout_seconds: 10,
        };
        let tracker = RunTracker::new(&budget, None);
        assert!(tracker.check().is_ok());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(tracker.remaining(), Duration::from_secs(6));
        assert_eq!(tracker.clamp(Duration::from_secs(60)), Duration::from_secs(6));
        assert_eq!(tracker.clamp(Duration::from_secs(2)), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            tracker.check(),
            Err(BudgetViolation::RunTimeout { limit_seconds: 10, .. })
        ));
        assert_eq!(tracker.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancellation_is_observed() {
        let cancellation = Cancellation::new();
        let tracker = RunTracker::new(&RunBudget::default(), Some(cancellation.subscribe()));

        assert!(tracker.check().is_ok());
        cancellation.cancel();
        cancellation.cancel();

        assert!(cancellation.is_cancelled());
        assert_eq!(tracker.check(), Err(BudgetViolation::Cancelled));
    }

    #[tokio::test]
    async fn test_unbounded_tracker() {
        let tracker = RunTracker::unbounded();
        assert!(tracker.check().is_ok());
        assert_eq!(tracker.clamp(Duration::from_secs(5)), Duration::from_secs(5));
    }
}

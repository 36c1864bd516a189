//! Stage names, outcomes and per-attempt results.
//!
//! A run records one `StageResult` per attempt. Records are append-only and
//! always appear in declared pipeline order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of a stage in the fixed deployment pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    Checkout,
    BuildBackend,
    BuildFrontend,
    Test,
    Scan,
    Deploy,
    Verify,
}

impl StageName {
    /// Declared pipeline order
    pub const ORDER: [StageName; 7] = [
        StageName::Checkout,
        StageName::BuildBackend,
        StageName::BuildFrontend,
        StageName::Test,
        StageName::Scan,
        StageName::Deploy,
        StageName::Verify,
    ];

    /// Get the stage name as it appears in logs and the API
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Checkout => "checkout",
            StageName::BuildBackend => "build-backend",
            StageName::BuildFrontend => "build-frontend",
            StageName::Test => "test",
            StageName::Scan => "scan",
            StageName::Deploy => "deploy",
            StageName::Verify => "verify",
        }
    }

    /// Index of this stage in the declared order
    pub fn position(&self) -> usize {
        Self::ORDER
            .iter()
            .position(|s| s == self)
            .unwrap_or(Self::ORDER.len())
    }

    /// Stages declared after this one
    pub fn following(&self) -> impl Iterator<Item = StageName> {
        let position = self.position();
        Self::ORDER.into_iter().skip(position + 1)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single stage attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// Not executed because a predecessor did not succeed
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Executor timeout or collaborator unavailable; retried per policy
    Transient,

    /// Test failure, scan threshold breach, unhealthy verify; never retried
    Policy,

    /// Non-retryable execution failure (build error, missing revision)
    Fatal,

    /// Operator cancellation or run budget exhausted
    Cancelled,
}

impl FailureClass {
    /// Whether a failure of this class may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::Transient => "transient",
            FailureClass::Policy => "policy",
            FailureClass::Fatal => "fatal",
            FailureClass::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one stage attempt within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: StageName,

    pub outcome: Outcome,

    /// 1-based retry counter
    pub attempt: u32,

    /// Set when `outcome` is `Failure`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,

    /// Diagnostic payload (log excerpt, scan findings, health response)
    #[serde(default)]
    pub detail: serde_json::Value,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub duration_ms: u64,
}

impl StageResult {
    pub fn success(name: StageName, attempt: u32, detail: serde_json::Value) -> Self {
        Self {
            name,
            outcome: Outcome::Success,
            attempt,
            failure: None,
            detail,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn failure(
        name: StageName,
        attempt: u32,
        class: FailureClass,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            name,
            outcome: Outcome::Failure,
            attempt,
            failure: Some(class),
            detail,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Record a stage that was never executed
    pub fn skipped(name: StageName, reason: impl Into<String>) -> Self {
        Self {
            name,
            outcome: Outcome::Skipped,
            attempt: 1,
            failure: None,
            detail: serde_json::json!({ "reason": reason.into() }),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Attach timing information
    pub fn with_timing(mut self, started_at: DateTime<Utc>, duration_ms: u64) -> Self {
        self.started_at = started_at;
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Short human-readable error message from the detail payload
    pub fn error_message(&self) -> Option<String> {
        self.detail
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
    }
}

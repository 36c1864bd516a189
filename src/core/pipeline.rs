//! Pipeline plan and settings.
//!
//! The stage sequence is fixed: each stage is a typed descriptor with a
//! declared set of predecessors. Settings (retry policy, timeouts, gate
//! thresholds) are loaded from YAML and every field has a default.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::budget::RunBudget;
use crate::domain::{Component, Severity, StageName};

/// A stage of the deployment pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Fetch the revision into a build context
    Checkout,

    /// Build one component image from the checked-out source
    Build(Component),

    /// Run the test suite in a fresh image derived from the backend build
    Test,

    /// Scan both images against the severity threshold
    Scan,

    /// Swap the target's images for the newly built ones
    Deploy,

    /// Poll the target's health contract
    Verify,
}

impl Stage {
    /// Declared pipeline order
    pub const PLAN: [Stage; 7] = [
        Stage::Checkout,
        Stage::Build(Component::Backend),
        Stage::Build(Component::Frontend),
        Stage::Test,
        Stage::Scan,
        Stage::Deploy,
        Stage::Verify,
    ];

    pub fn name(&self) -> StageName {
        match self {
            Stage::Checkout => StageName::Checkout,
            Stage::Build(component) => component.build_stage(),
            Stage::Test => StageName::Test,
            Stage::Scan => StageName::Scan,
            Stage::Deploy => StageName::Deploy,
            Stage::Verify => StageName::Verify,
        }
    }

    /// Look up the descriptor for a stage name
    pub fn from_name(name: StageName) -> Self {
        match name {
            StageName::Checkout => Stage::Checkout,
            StageName::BuildBackend => Stage::Build(Component::Backend),
            StageName::BuildFrontend => Stage::Build(Component::Frontend),
            StageName::Test => Stage::Test,
            StageName::Scan => Stage::Scan,
            StageName::Deploy => Stage::Deploy,
            StageName::Verify => Stage::Verify,
        }
    }

    /// Stages that must end in `Success` before this one may execute
    pub fn predecessors(&self) -> &'static [StageName] {
        match self {
            Stage::Checkout => &[],
            Stage::Build(_) => &[StageName::Checkout],
            Stage::Test => &[StageName::BuildBackend, StageName::BuildFrontend],
            Stage::Scan => &[StageName::Test],
            Stage::Deploy => &[StageName::Scan],
            Stage::Verify => &[StageName::Deploy],
        }
    }

    /// Whether transient failures of this stage are retried.
    ///
    /// A missing revision cannot be retried away, and verify already polls
    /// until its own deadline.
    pub fn retryable(&self) -> bool {
        !matches!(self, Stage::Checkout | Stage::Verify)
    }
}

/// Pipeline settings (the `pipeline:` section of the config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-stage executor timeouts
    #[serde(default)]
    pub timeouts: StageTimeouts,

    /// Findings at or above this severity block the scan gate
    #[serde(default = "default_severity_threshold")]
    pub severity_threshold: Severity,

    /// Health gate polling
    #[serde(default)]
    pub health: HealthSettings,

    /// Whole-run wall-clock budget
    #[serde(default)]
    pub budget: RunBudget,

    /// Command run inside the test image
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,

    /// Repository prefix for built images
    #[serde(default = "default_image_repository")]
    pub image_repository: String,
}

fn default_severity_threshold() -> Severity {
    Severity::High
}
fn default_test_command() -> Vec<String> {
    vec!["make".to_string(), "test".to_string()]
}
fn default_image_repository() -> String {
    "shipgate.local".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            severity_threshold: default_severity_threshold(),
            health: HealthSettings::default(),
            budget: RunBudget::default(),
            test_command: default_test_command(),
            image_repository: default_image_repository(),
        }
    }
}

impl PipelineSettings {
    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline settings: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse settings from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline settings YAML")
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), PipelineConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(PipelineConfigError::ZeroAttempts);
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(PipelineConfigError::ShrinkingBackoff(
                self.retry.backoff_multiplier,
            ));
        }

        for stage in Stage::PLAN {
            if self.stage_timeout(stage.name()).is_zero() {
                return Err(PipelineConfigError::ZeroTimeout(stage.name()));
            }
        }

        if self.health.interval_ms == 0 {
            return Err(PipelineConfigError::ZeroHealthInterval);
        }
        if self.health.failure_threshold == 0 {
            return Err(PipelineConfigError::ZeroFailureThreshold);
        }
        if self.test_command.is_empty() {
            return Err(PipelineConfigError::EmptyTestCommand);
        }
        if self.image_repository.trim().is_empty() {
            return Err(PipelineConfigError::EmptyImageRepository);
        }

        Ok(())
    }

    /// Executor timeout for a stage.
    ///
    /// Verify is bounded by the health deadline plus one poll interval so a
    /// poll that starts just before the deadline can still report.
    pub fn stage_timeout(&self, stage: StageName) -> Duration {
        match stage {
            StageName::Verify => self.health.deadline() + self.health.interval(),
            other => self.timeouts.for_stage(other),
        }
    }
}

/// Invalid pipeline settings
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineConfigError {
    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("retry.backoff_multiplier must be >= 1.0 (got {0})")]
    ShrinkingBackoff(f64),

    #[error("timeout for stage '{0}' must be greater than zero")]
    ZeroTimeout(StageName),

    #[error("health.interval_ms must be greater than zero")]
    ZeroHealthInterval,

    #[error("health.failure_threshold must be at least 1")]
    ZeroFailureThreshold,

    #[error("test_command cannot be empty")]
    EmptyTestCommand,

    #[error("image_repository cannot be empty")]
    EmptyImageRepository,
}

/// Retry policy for transient stage failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-stage executor timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_checkout_timeout")]
    pub checkout_seconds: u64,

    /// Applies to each build stage independently
    #[serde(default = "default_build_timeout")]
    pub build_seconds: u64,

    #[serde(default = "default_test_timeout")]
    pub test_seconds: u64,

    #[serde(default = "default_scan_timeout")]
    pub scan_seconds: u64,

    #[serde(default = "default_deploy_timeout")]
    pub deploy_seconds: u64,
}

fn default_checkout_timeout() -> u64 {
    300
}
fn default_build_timeout() -> u64 {
    1800
}
fn default_test_timeout() -> u64 {
    900
}
fn default_scan_timeout() -> u64 {
    600
}
fn default_deploy_timeout() -> u64 {
    300
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            checkout_seconds: default_checkout_timeout(),
            build_seconds: default_build_timeout(),
            test_seconds: default_test_timeout(),
            scan_seconds: default_scan_timeout(),
            deploy_seconds: default_deploy_timeout(),
        }
    }
}

impl StageTimeouts {
    /// Timeout for a non-verify stage
    pub fn for_stage(&self, stage: StageName) -> Duration {
        let seconds = match stage {
            StageName::Checkout => self.checkout_seconds,
            StageName::BuildBackend | StageName::BuildFrontend => self.build_seconds,
            StageName::Test => self.test_seconds,
            StageName::Scan => self.scan_seconds,
            StageName::Deploy | StageName::Verify => self.deploy_seconds,
        };
        Duration::from_secs(seconds)
    }
}

/// Health gate polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Delay between polls in milliseconds (default: 2000)
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// How long verify waits for a healthy target (default: 120)
    #[serde(default = "default_deadline")]
    pub deadline_seconds: u64,

    /// Consecutive `Down` polls that end verify early (default: 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_interval() -> u64 {
    2000
}
fn default_deadline() -> u64 {
    120
}
fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            deadline_seconds: default_deadline(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_seconds)
    }
}

//! Pipeline run state and reconstruction from events.
//!
//! A PipelineRun represents one execution triggered by one push event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{RunEvent, RunEventType};
use super::stage::{FailureClass, Outcome, StageName, StageResult};

/// Where a run came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOrigin {
    /// Source revision that triggered the run
    pub commit_ref: String,

    pub branch: String,

    /// Clone URL of the repository
    pub repository: String,

    /// Webhook delivery id (absent for manual runs)
    #[serde(default)]
    pub delivery_id: Option<String>,

    /// Deployment target the run promotes to
    pub target: String,
}

/// One end-to-end pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier, assigned at creation
    pub id: Uuid,

    pub commit_ref: String,

    pub branch: String,

    pub repository: String,

    pub delivery_id: Option<String>,

    pub target: String,

    pub state: RunState,

    /// Stage attempts in declared pipeline order (append-only)
    pub stages: Vec<StageResult>,

    /// The single rollback deploy attempt, if one was made
    pub rollback: Option<StageResult>,

    /// Stage and classification at which the forward pipeline stopped
    pub failure: Option<RunFailure>,

    /// Set when the run needs operator intervention
    pub alarm: Option<String>,

    /// When the run was accepted
    pub created_at: DateTime<Utc>,

    /// When the run left Pending
    pub started_at: Option<DateTime<Utc>>,

    /// Set exactly once, on transition into a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Create a new pending run
    pub fn new(origin: RunOrigin) -> Self {
        Self::with_id(Uuid::new_v4(), origin, Utc::now())
    }

    fn with_id(id: Uuid, origin: RunOrigin, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            commit_ref: origin.commit_ref,
            branch: origin.branch,
            repository: origin.repository,
            delivery_id: origin.delivery_id,
            target: origin.target,
            state: RunState::Pending,
            stages: Vec::new(),
            rollback: None,
            failure: None,
            alarm: None,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Trigger information for this run
    pub fn origin(&self) -> RunOrigin {
        RunOrigin {
            commit_ref: self.commit_ref.clone(),
            branch: self.branch.clone(),
            repository: self.repository.clone(),
            delivery_id: self.delivery_id.clone(),
            target: self.target.clone(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[RunEvent]) -> Option<Self> {
        let first = events.first()?;
        if first.event_type != RunEventType::Created {
            return None;
        }
        let origin = first.origin.clone()?;

        let mut run = Self::with_id(first.run_id, origin, first.timestamp);
        for event in &events[1..] {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &RunEvent) {
        match event.event_type {
            RunEventType::Created => {}
            RunEventType::StateChanged => {
                if let Some(state) = event.state {
                    // A terminal state is final; only a completed rollback follows Failed
                    let rollback = self.state == RunState::Failed && state == RunState::RolledBack;
                    if self.state.is_terminal() && !rollback {
                        return;
                    }
                    if state == RunState::Running && self.started_at.is_none() {
                        self.started_at = Some(event.timestamp);
                    }
                    if state.is_terminal() && self.finished_at.is_none() {
                        self.finished_at = Some(event.timestamp);
                    }
                    self.state = state;
                }
            }
            RunEventType::StageRecorded => {
                if let Some(ref stage) = event.stage {
                    self.stages.push(stage.clone());
                }
            }
            RunEventType::RollbackRecorded => {
                if let Some(ref stage) = event.stage {
                    self.rollback = Some(stage.clone());
                }
            }
            RunEventType::FailureRecorded => {
                if let Some(ref failure) = event.failure {
                    self.failure = Some(failure.clone());
                }
            }
            RunEventType::AlarmRaised => {
                if let Some(ref alarm) = event.alarm {
                    self.alarm = Some(alarm.clone());
                }
            }
        }
    }

    /// Check if the run has reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Latest record for a stage (its final attempt)
    pub fn latest(&self, name: StageName) -> Option<&StageResult> {
        self.stages.iter().rev().find(|s| s.name == name)
    }

    /// Check if a stage's final attempt succeeded
    pub fn is_stage_successful(&self, name: StageName) -> bool {
        self.latest(name).map(|s| s.is_success()).unwrap_or(false)
    }

    /// Whether every stage in the pipeline ended in Success
    pub fn all_stages_successful(&self) -> bool {
        StageName::ORDER.iter().all(|s| self.is_stage_successful(*s))
    }

    /// Whether a forward deploy succeeded and a later verify failed
    pub fn is_rollback_eligible(&self) -> bool {
        let deploy = self
            .stages
            .iter()
            .position(|s| s.name == StageName::Deploy && s.is_success());
        let verify = self
            .stages
            .iter()
            .rposition(|s| s.name == StageName::Verify && s.outcome == Outcome::Failure);
        matches!((deploy, verify), (Some(d), Some(v)) if d < v)
    }

    /// The stage at which the forward pipeline stopped
    pub fn stopped_at(&self) -> Option<StageName> {
        if let Some(ref failure) = self.failure {
            if failure.stage.is_some() {
                return failure.stage;
            }
        }
        self.stages
            .iter()
            .find(|s| s.outcome == Outcome::Failure && self.latest(s.name) == Some(*s))
            .map(|s| s.name)
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepted, waiting for the target's worker
    Pending,

    /// A stage is in flight
    Running,

    /// Every stage succeeded and the target is healthy
    Succeeded,

    /// The run stopped at a failing stage
    Failed,

    /// Verify failed after deploy and the previous images were restored
    RolledBack,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::RolledBack
        )
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Why the forward pipeline stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// None when the run was cancelled before any stage ran
    pub stage: Option<StageName>,

    pub class: FailureClass,

    pub message: String,
}

//! Event types for the run log.
//!
//! Every change to a run is recorded as an immutable event in an append-only
//! log. The current state of a run is rebuilt by replaying its events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{RunFailure, RunOrigin, RunState};
use super::stage::StageResult;

/// A single event in a run's log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Type of event
    pub event_type: RunEventType,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Trigger information (Created only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<RunOrigin>,

    /// Stage record (StageRecorded / RollbackRecorded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageResult>,

    /// New run state (StateChanged)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,

    /// Forward failure (FailureRecorded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,

    /// Operator alarm (AlarmRaised)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<String>,
}

impl RunEvent {
    /// Create a bare event with the current timestamp
    pub fn new(run_id: Uuid, event_type: RunEventType, summary: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            event_type,
            summary,
            origin: None,
            stage: None,
            state: None,
            failure: None,
            alarm: None,
        }
    }

    pub fn created(run_id: Uuid, origin: RunOrigin) -> Self {
        let summary = format!("Run created for {} on {}", origin.commit_ref, origin.branch);
        Self {
            origin: Some(origin),
            ..Self::new(run_id, RunEventType::Created, summary)
        }
    }

    pub fn state_changed(run_id: Uuid, state: RunState) -> Self {
        Self {
            state: Some(state),
            ..Self::new(run_id, RunEventType::StateChanged, format!("Run is now {}", state))
        }
    }

    pub fn stage_recorded(run_id: Uuid, result: StageResult) -> Self {
        let summary = format!(
            "Stage '{}' attempt {}: {:?}",
            result.name, result.attempt, result.outcome
        );
        Self {
            stage: Some(result),
            ..Self::new(run_id, RunEventType::StageRecorded, summary)
        }
    }

    pub fn rollback_recorded(run_id: Uuid, result: StageResult) -> Self {
        let summary = format!("Rollback deploy: {:?}", result.outcome);
        Self {
            stage: Some(result),
            ..Self::new(run_id, RunEventType::RollbackRecorded, summary)
        }
    }

    pub fn failure_recorded(run_id: Uuid, failure: RunFailure) -> Self {
        let summary = format!("Run failed ({}): {}", failure.class, failure.message);
        Self {
            failure: Some(failure),
            ..Self::new(run_id, RunEventType::FailureRecorded, summary)
        }
    }

    pub fn alarm_raised(run_id: Uuid, alarm: String) -> Self {
        Self {
            summary: format!("ALARM: {}", alarm),
            alarm: Some(alarm),
            ..Self::new(run_id, RunEventType::AlarmRaised, String::new())
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    /// A run was accepted and queued
    Created,

    /// The run moved to a new state
    StateChanged,

    /// A stage attempt finished (or was skipped)
    StageRecorded,

    /// The single rollback deploy attempt finished
    RollbackRecorded,

    /// The stage and classification at which the run stopped
    FailureRecorded,

    /// The run needs operator intervention
    AlarmRaised,
}

//! Core orchestration logic.
//!
//! This module contains:
//! - RunStore: per-run append-only event logs
//! - Pipeline: the declared stage plan and its settings
//! - Budget: whole-run budget and operator cancellation
//! - StageExecutor / HealthGate: one stage attempt, post-deploy polling
//! - PipelineEngine: the run state machine
//! - Dispatcher: per-target FIFO queue and worker
//! - TargetLock: one shipgate process per target

pub mod budget;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod health_gate;
pub mod notify;
pub mod pipeline;
pub mod run_store;
pub mod target_lock;

// Re-export commonly used types
pub use budget::{BudgetViolation, Cancellation, RunBudget, RunTracker};
pub use dispatcher::{DispatchError, Dispatcher};
pub use engine::PipelineEngine;
pub use executor::{StageContext, StageExecutor, StageOp, StageOutput};
pub use health_gate::{HealthGate, HealthReport, Verdict};
pub use notify::{NotificationSink, RunNotification, SinkConfig};
pub use pipeline::{
    HealthSettings, PipelineConfigError, PipelineSettings, RetryPolicy, Stage, StageTimeouts,
};
pub use run_store::{RunStore, StoreError};
pub use target_lock::TargetLock;

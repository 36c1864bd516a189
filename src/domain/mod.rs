//! Domain types for the deployment pipeline.
//!
//! This module contains the core data structures:
//! - Stage: stage names, outcomes and per-attempt results
//! - Run: pipeline run state
//! - Events: immutable records of run changes
//! - Image: image references, findings and the deployment target

pub mod events;
pub mod image;
pub mod run;
pub mod stage;

// Re-export commonly used types
pub use events::{RunEvent, RunEventType};
pub use image::{Component, DeploymentTarget, Finding, ImageRef, ImageSet, ServiceSpec, Severity};
pub use run::{PipelineRun, RunFailure, RunOrigin, RunState};
pub use stage::{FailureClass, Outcome, StageName, StageResult};

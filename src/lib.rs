//! shipgate - push-triggered build, scan and staging deployment pipeline
//!
//! A signed push notification for the deployment branch becomes a
//! `PipelineRun` that moves through a fixed sequence of gated stages:
//! checkout, backend and frontend image builds, tests, a vulnerability
//! scan, deploy to the staging target and a post-deploy health check.
//! A failed health check rolls the target back to the images it served
//! before.
//!
//! # Architecture
//!
//! Runs are event-sourced:
//! - Every stage attempt and state change is an immutable event
//! - A run's current state is derived by replaying its events
//! - Terminal states are never overwritten
//!
//! # Modules
//!
//! - `trigger`: signature check, payload parsing, branch filter, dedup
//! - `core`: engine, stage executor, health gate, run store, dispatcher
//! - `adapters`: git, docker and trivy collaborators
//! - `domain`: data structures (PipelineRun, StageResult, ImageRef)
//! - `server`: HTTP endpoints
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Serve the trigger endpoint
//! SHIPGATE_WEBHOOK_SECRET=... shipgate serve
//!
//! # Run the pipeline for one commit
//! shipgate run 3f2c1e9 --repository https://example.com/app.git
//!
//! # Inspect runs
//! shipgate runs --commit 3f2c1e9
//! shipgate status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod server;
pub mod trigger;

// Re-export main types at crate root for convenience
pub use core::{Dispatcher, PipelineEngine, RunStore};
pub use domain::{PipelineRun, RunEvent, RunEventType, RunState, StageName, StageResult};
pub use trigger::{PipelineRequest, TriggerReceiver};

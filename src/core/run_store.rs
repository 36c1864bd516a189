//! Run Store: the single source of truth for pipeline runs.
//!
//! Every change to a run is an event appended to that run's log, stored as
//! newline-delimited JSON (JSONL) under `<root>/<run-id>/events.jsonl`.
//! The in-memory view of a run is rebuilt by replaying its events.
//!
//! Appends to one run are serialized by a per-run lock; unrelated runs
//! never contend on anything but a short map lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    FailureClass, ImageSet, PipelineRun, RunEvent, RunFailure, RunState, StageName, StageResult,
};

/// Minimum length of a commit prefix accepted by `find_by_commit`
pub const MIN_COMMIT_PREFIX: usize = 7;

/// Errors raised by the Run Store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("run {0} already exists")]
    AlreadyExists(Uuid),

    /// A terminal state may never be overwritten
    #[error("run {run_id} is already {current}; refusing to set {attempted}")]
    Consistency {
        run_id: Uuid,
        current: RunState,
        attempted: RunState,
    },

    #[error("run {run_id} is {state}; no further records may be appended")]
    Finished { run_id: Uuid, state: RunState },

    #[error("run {run_id}: stage '{stage}' cannot be recorded after '{after}'")]
    OutOfOrder {
        run_id: Uuid,
        stage: StageName,
        after: StageName,
    },

    #[error("run {run_id}: {reason}")]
    InvalidTransition { run_id: Uuid, reason: String },

    #[error("run log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("run log serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error signals a terminal-state race
    pub fn is_consistency(&self) -> bool {
        matches!(self, StoreError::Consistency { .. })
    }
}

/// One run and its log
struct RunSlot {
    run: PipelineRun,

    /// None for in-memory stores
    events_path: Option<PathBuf>,
}

impl RunSlot {
    /// Persist an event, then apply it to the in-memory view
    async fn record(&mut self, event: RunEvent) -> Result<(), StoreError> {
        if let Some(ref path) = self.events_path {
            append_event(path, &event).await?;
        }
        self.run.apply_event(&event);
        Ok(())
    }

    /// Persist an event if possible and apply it either way; false if not persisted
    async fn record_lossy(&mut self, event: RunEvent) -> bool {
        let persisted = match self.events_path {
            Some(ref path) => match append_event(path, &event).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(run_id = %self.run.id, error = %e, "Event applied but not persisted");
                    false
                }
            },
            None => true,
        };
        self.run.apply_event(&event);
        persisted
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.run.is_finished() {
            return Err(StoreError::Finished {
                run_id: self.run.id,
                state: self.run.state,
            });
        }
        Ok(())
    }
}

/// Store of all pipeline runs
pub struct RunStore {
    /// Directory holding one subdirectory per run (None: memory only)
    root: Option<PathBuf>,

    runs: RwLock<HashMap<Uuid, Arc<Mutex<RunSlot>>>>,
}

impl RunStore {
    /// A store that keeps runs in memory only
    pub fn in_memory() -> Self {
        Self {
            root: None,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Open a persistent store, replaying every run found under `root`
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create runs directory: {}", root.display()))?;

        let mut runs = HashMap::new();
        let mut entries = fs::read_dir(&root)
            .await
            .with_context(|| format!("Failed to read runs directory: {}", root.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(run_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };

            let events_path = entry.path().join("events.jsonl");
            let events = match replay(&events_path).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(%run_id, error = %e, "Skipping unreadable run log");
                    continue;
                }
            };

            match PipelineRun::from_events(&events) {
                Some(run) if run.id == run_id => {
                    runs.insert(
                        run_id,
                        Arc::new(Mutex::new(RunSlot {
                            run,
                            events_path: Some(events_path),
                        })),
                    );
                }
                _ => warn!(%run_id, "Skipping run log without a creation event"),
            }
        }

        debug!(runs = runs.len(), root = %root.display(), "Run store opened");

        Ok(Self {
            root: Some(root),
            runs: RwLock::new(runs),
        })
    }

    /// Directory holding run logs, if persistent
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    async fn slot(&self, id: Uuid) -> Result<Arc<Mutex<RunSlot>>, StoreError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Register a new pending run
    pub async fn create(&self, run: &PipelineRun) -> Result<Uuid, StoreError> {
        if run.state != RunState::Pending || !run.stages.is_empty() {
            return Err(StoreError::InvalidTransition {
                run_id: run.id,
                reason: "only a fresh pending run can be created".to_string(),
            });
        }

        let mut event = RunEvent::created(run.id, run.origin());
        event.timestamp = run.created_at;

        let events_path = match self.root {
            Some(ref root) => {
                let run_dir = root.join(run.id.to_string());
                fs::create_dir_all(&run_dir).await?;
                Some(run_dir.join("events.jsonl"))
            }
            None => None,
        };

        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id));
        }
        if let Some(ref path) = events_path {
            append_event(path, &event).await?;
        }
        runs.insert(
            run.id,
            Arc::new(Mutex::new(RunSlot {
                run: run.clone(),
                events_path,
            })),
        );

        Ok(run.id)
    }

    /// Append a stage attempt in declared order.
    ///
    /// The first append moves a pending run to Running.
    pub async fn append_stage(&self, id: Uuid, result: StageResult) -> Result<(), StoreError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_open()?;

        if let Some(last) = slot.run.stages.last() {
            if result.name < last.name {
                return Err(StoreError::OutOfOrder {
                    run_id: id,
                    stage: result.name,
                    after: last.name,
                });
            }
        }

        if slot.run.state == RunState::Pending {
            slot.record(RunEvent::state_changed(id, RunState::Running))
                .await?;
        }
        slot.record(RunEvent::stage_recorded(id, result)).await
    }

    /// Record the single rollback deploy attempt
    pub async fn record_rollback(&self, id: Uuid, result: StageResult) -> Result<(), StoreError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        // A run already marked Failed may still record its rollback
        if slot.run.state != RunState::Failed {
            slot.ensure_open()?;
        }

        if slot.run.rollback.is_some() {
            return Err(StoreError::InvalidTransition {
                run_id: id,
                reason: "rollback already attempted".to_string(),
            });
        }
        if !slot.run.is_rollback_eligible() {
            return Err(StoreError::InvalidTransition {
                run_id: id,
                reason: "rollback requires a successful deploy followed by a failed verify"
                    .to_string(),
            });
        }

        slot.record(RunEvent::rollback_recorded(id, result)).await
    }

    /// Record where and why the forward pipeline stopped
    pub async fn record_failure(&self, id: Uuid, failure: RunFailure) -> Result<(), StoreError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_open()?;
        slot.record(RunEvent::failure_recorded(id, failure)).await
    }

    /// Flag the run for operator intervention
    pub async fn raise_alarm(&self, id: Uuid, alarm: impl Into<String>) -> Result<(), StoreError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.record(RunEvent::alarm_raised(id, alarm.into())).await
    }

    /// Move a run to a new state, returning the updated run.
    ///
    /// A terminal state is never overwritten; the only move out of a
    /// terminal state is `Failed -> RolledBack` after a successful rollback.
    pub async fn set_state(&self, id: Uuid, state: RunState) -> Result<PipelineRun, StoreError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        let current = slot.run.state;

        if current.is_terminal() {
            let rolled_back = current == RunState::Failed && state == RunState::RolledBack;
            if !rolled_back {
                return Err(StoreError::Consistency {
                    run_id: id,
                    current,
                    attempted: state,
                });
            }
        }

        if state == current && !current.is_terminal() {
            return Ok(slot.run.clone());
        }

        let invalid = |reason: &str| StoreError::InvalidTransition {
            run_id: id,
            reason: format!("{} -> {}: {}", current, state, reason),
        };

        match state {
            RunState::Pending => return Err(invalid("a run never returns to pending")),
            RunState::Running => {}
            RunState::Failed => {}
            RunState::Succeeded => {
                if !slot.run.all_stages_successful() {
                    return Err(invalid("not every stage succeeded"));
                }
            }
            RunState::RolledBack => {
                if !slot.run.is_rollback_eligible() {
                    return Err(invalid("no successful deploy followed by a failed verify"));
                }
                if !slot.run.rollback.as_ref().is_some_and(|r| r.is_success()) {
                    return Err(invalid("no successful rollback deploy recorded"));
                }
            }
        }

        slot.record(RunEvent::state_changed(id, state)).await?;
        Ok(slot.run.clone())
    }

    /// Get a run by id
    pub async fn get(&self, id: Uuid) -> Result<PipelineRun, StoreError> {
        let slot = self.slot(id).await?;
        let run = slot.lock().await.run.clone();
        Ok(run)
    }

    /// Runs for a commit (full SHA or unambiguous prefix), newest first
    pub async fn find_by_commit(&self, commit: &str) -> Vec<PipelineRun> {
        let commit = commit.trim().to_ascii_lowercase();
        if commit.len() < MIN_COMMIT_PREFIX {
            return Vec::new();
        }

        let mut runs: Vec<PipelineRun> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|run| run.commit_ref.to_ascii_lowercase().starts_with(&commit))
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Most recent runs, newest first
    pub async fn list(&self, limit: usize) -> Vec<PipelineRun> {
        let mut runs = self.snapshot().await;
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        runs
    }

    /// Images `target` serves according to the recorded history.
    ///
    /// Replays every successful deploy and rollback deploy in execution
    /// order, so a restarted server knows what to roll back to.
    pub async fn served_images(&self, target: &str) -> ImageSet {
        let mut runs: Vec<PipelineRun> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|run| run.target == target && run.started_at.is_some())
            .collect();
        runs.sort_by_key(|run| run.started_at);

        let mut served = ImageSet::new();
        for run in &runs {
            let deploys = run
                .latest(StageName::Deploy)
                .into_iter()
                .chain(run.rollback.as_ref())
                .filter(|result| result.is_success());

            for result in deploys {
                let Some(services) = result.detail.get("services") else {
                    continue;
                };
                match serde_json::from_value::<ImageSet>(services.clone()) {
                    Ok(images) => served.extend(images),
                    Err(e) => warn!(run_id = %run.id, error = %e, "Unreadable deploy record"),
                }
            }
        }
        served
    }

    /// Fail a run whose execution was aborted by an error.
    ///
    /// The Failed state reaches the in-memory view even when the log cannot
    /// be written, so this process never reports the run as active. A
    /// close-out that missed the log is repeated by `close_interrupted` after
    /// a restart.
    pub async fn abandon(&self, id: Uuid, failure: RunFailure) -> Result<PipelineRun, StoreError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.ensure_open()?;

        let recorded = slot
            .record_lossy(RunEvent::failure_recorded(id, failure))
            .await;
        let closed = slot
            .record_lossy(RunEvent::state_changed(id, RunState::Failed))
            .await;
        if !(recorded && closed) {
            warn!(run_id = %id, "Aborted run closed in memory only");
        }
        Ok(slot.run.clone())
    }

    /// Fail every run left unfinished by a previous process.
    ///
    /// Nothing resumes an interrupted run; it is closed as cancelled so
    /// inspection shows where it stopped. Returns the closed runs.
    pub async fn close_interrupted(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let mut closed = Vec::new();
        for run in self.snapshot().await {
            if run.is_finished() {
                continue;
            }
            let failure = RunFailure {
                stage: run.stopped_at(),
                class: FailureClass::Cancelled,
                message: "interrupted by a restart".to_string(),
            };
            self.record_failure(run.id, failure).await?;
            let run = self.set_state(run.id, RunState::Failed).await?;
            warn!(run_id = %run.id, "Closed run interrupted by a restart");
            closed.push(run);
        }
        Ok(closed)
    }

    async fn snapshot(&self) -> Vec<PipelineRun> {
        let slots: Vec<Arc<Mutex<RunSlot>>> = self.runs.read().await.values().cloned().collect();

        let mut runs = Vec::with_capacity(slots.len());
        for slot in slots {
            runs.push(slot.lock().await.run.clone());
        }
        runs
    }
}

/// Append an event to a JSONL log
async fn append_event(path: &Path, event: &RunEvent) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let json = serde_json::to_string(event)?;
    file.write_all(format!("{}\n", json).as_bytes()).await?;
    file.flush().await?;

    Ok(())
}

/// Replay all events of a log in order
async fn replay(path: &Path) -> anyhow::Result<Vec<RunEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut events = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event: RunEvent = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse event: {}", line))?;
        events.push(event);
    }

    Ok(events)
}

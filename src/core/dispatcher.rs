//! Per-target run queue.
//!
//! Accepted requests become Pending runs on a bounded FIFO queue. A single
//! worker owns the DeploymentTarget and executes queued runs one at a time,
//! so two runs never mutate the same target concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use uuid::Uuid;

use super::budget::{Cancellation, RunBudget, RunTracker};
use super::engine::PipelineEngine;
use super::run_store::StoreError;
use crate::domain::{DeploymentTarget, ImageSet, PipelineRun};
use crate::trigger::PipelineRequest;

/// Why a request could not be queued
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue for target '{0}' is full")]
    QueueFull(String),

    #[error("worker for target '{0}' has stopped")]
    Closed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

type Registry = Arc<Mutex<HashMap<Uuid, Cancellation>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Uuid, Cancellation>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle for queueing runs against one deployment target
#[derive(Clone)]
pub struct Dispatcher {
    target_name: String,
    engine: Arc<PipelineEngine>,
    queue: mpsc::Sender<Uuid>,
    cancellations: Registry,
    current: watch::Receiver<ImageSet>,
}

impl Dispatcher {
    /// Start the worker for `target`; it runs until every handle is dropped
    pub fn spawn(
        engine: Arc<PipelineEngine>,
        target: DeploymentTarget,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let (images_tx, current) = watch::channel(target.current.clone());
        let cancellations: Registry = Arc::new(Mutex::new(HashMap::new()));

        let dispatcher = Self {
            target_name: target.name.clone(),
            engine: Arc::clone(&engine),
            queue,
            cancellations: Arc::clone(&cancellations),
            current,
        };

        let budget = engine.settings().budget.clone();
        let handle = tokio::spawn(work(engine, target, rx, cancellations, images_tx, budget));

        (dispatcher, handle)
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Create a Pending run for `request` and queue it (FIFO)
    pub async fn submit(&self, request: &PipelineRequest) -> Result<PipelineRun, DispatchError> {
        let permit = self.queue.try_reserve().map_err(|e| {
            let target = self.target_name.clone();
            match e {
                mpsc::error::TrySendError::Full(()) => DispatchError::QueueFull(target),
                mpsc::error::TrySendError::Closed(()) => DispatchError::Closed(target),
            }
        })?;

        let run = PipelineRun::new(request.origin(&self.target_name));
        self.engine.store().create(&run).await?;
        lock(&self.cancellations).insert(run.id, Cancellation::new());

        permit.send(run.id);
        info!(run_id = %run.id, commit = %run.commit_ref, "Run queued");

        Ok(run)
    }

    /// Signal a queued or running run to stop at its next stage boundary
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match lock(&self.cancellations).get(&run_id) {
            Some(cancellation) => {
                cancellation.cancel();
                info!(%run_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Images the target currently serves
    pub fn current_images(&self) -> ImageSet {
        self.current.borrow().clone()
    }

    /// Number of free queue slots
    pub fn available_slots(&self) -> usize {
        self.queue.capacity()
    }
}

#[instrument(skip_all, fields(deployment = %target.name))]
async fn work(
    engine: Arc<PipelineEngine>,
    mut target: DeploymentTarget,
    mut queue: mpsc::Receiver<Uuid>,
    cancellations: Registry,
    images: watch::Sender<ImageSet>,
    budget: RunBudget,
) {
    info!("Worker started");

    while let Some(run_id) = queue.recv().await {
        let cancel = lock(&cancellations).get(&run_id).map(Cancellation::subscribe);
        let tracker = RunTracker::new(&budget, cancel);

        match engine.execute(run_id, &mut target, tracker).await {
            Ok(run) => info!(%run_id, state = %run.state, "Run complete"),
            Err(e) => {
                engine.abort(run_id, &e).await;
            }
        }

        lock(&cancellations).remove(&run_id);
        images.send_replace(target.current.clone());
    }

    info!("Worker stopped");
}

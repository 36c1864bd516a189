//! Pipeline Engine: drives one run through the fixed stage plan.
//!
//! The engine advances a run through `Pending -> Running -> terminal`,
//! applying the gating rule (a stage runs only if its predecessors
//! succeeded), the retry policy (transient failures only) and the rollback
//! policy (one restore deploy after a failed verify). Every stage outcome is
//! written to the Run Store before the engine acts on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::budget::{BudgetViolation, RunTracker};
use super::executor::{StageContext, StageExecutor, StageOp, StageOutput};
use super::notify::{NotificationSink, RunNotification};
use super::pipeline::{PipelineSettings, Stage};
use super::run_store::RunStore;
use crate::adapters::Collaborators;
use crate::domain::{
    Component, DeploymentTarget, FailureClass, ImageRef, ImageSet, PipelineRun, RunFailure,
    RunState, StageName, StageResult,
};

/// Alarm raised when verify fails on a target that had nothing to restore
pub const NO_PREVIOUS_IMAGES: &str = "no previous image set to restore";

/// Alarm prefix for services a rollback could not restore
pub const NOT_RESTORED: &str = "no previous image for";

/// Every attempt made for one stage
struct StageRun {
    attempts: Vec<StageResult>,
    output: Option<StageOutput>,
}

impl StageRun {
    /// Why the stage's final attempt failed, if it did
    fn failure(&self) -> Option<RunFailure> {
        let last = self.attempts.last()?;
        if last.is_success() {
            return None;
        }
        Some(RunFailure {
            stage: Some(last.name),
            class: last.failure.unwrap_or(FailureClass::Fatal),
            message: last
                .error_message()
                .unwrap_or_else(|| format!("stage '{}' failed", last.name)),
        })
    }
}

/// Main pipeline engine
pub struct PipelineEngine {
    store: Arc<RunStore>,
    executor: StageExecutor,
    settings: PipelineSettings,
    sink: Arc<dyn NotificationSink>,
}

impl PipelineEngine {
    /// Create a new engine
    pub fn new(
        store: Arc<RunStore>,
        collaborators: Collaborators,
        settings: PipelineSettings,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            executor: StageExecutor::new(collaborators, &settings),
            store,
            settings,
            sink,
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Execute a pending run against `target` until it reaches a terminal state.
    ///
    /// Stage failures end up in the run record; only Run Store failures are
    /// returned as errors.
    #[instrument(skip(self, target, tracker), fields(run_id = %run_id, deployment = %target.name))]
    pub async fn execute(
        &self,
        run_id: Uuid,
        target: &mut DeploymentTarget,
        tracker: RunTracker,
    ) -> Result<PipelineRun> {
        let run = self.store.get(run_id).await?;
        if run.state != RunState::Pending {
            bail!("run {} is {}, not pending", run_id, run.state);
        }

        // Cancelled or out of budget while queued
        if let Err(violation) = tracker.check() {
            return self.cancel(run_id, None, violation).await;
        }

        self.store.set_state(run_id, RunState::Running).await?;
        info!(commit = %run.commit_ref, branch = %run.branch, "Starting pipeline run");

        let ctx = StageContext::new(run_id, &run.commit_ref);

        // 1. checkout
        let checkout = self
            .run_with_retry(
                Stage::Checkout,
                StageOp::Checkout {
                    repository: &run.repository,
                    commit: &run.commit_ref,
                },
                &ctx,
                &tracker,
                true,
            )
            .await?;
        if let Some(done) = self.settle(run_id, StageName::Checkout, &checkout, &tracker).await? {
            return Ok(done);
        }
        let Some(StageOutput::Source(source)) = checkout.output else {
            bail!("checkout succeeded without a source tree");
        };

        // 2. both builds, concurrently; recorded in declared order
        let (backend, frontend) = tokio::join!(
            self.run_with_retry(
                Stage::Build(Component::Backend),
                StageOp::Build {
                    component: Component::Backend,
                    source: &source,
                },
                &ctx,
                &tracker,
                false,
            ),
            self.run_with_retry(
                Stage::Build(Component::Frontend),
                StageOp::Build {
                    component: Component::Frontend,
                    source: &source,
                },
                &ctx,
                &tracker,
                false,
            ),
        );
        let (backend, frontend) = (backend?, frontend?);
        for result in backend.attempts.iter().chain(frontend.attempts.iter()) {
            self.store.append_stage(run_id, result.clone()).await?;
        }

        if let Err(violation) = tracker.check() {
            return self
                .cancel(run_id, Some(StageName::BuildFrontend), violation)
                .await;
        }
        if let Some(failure) = merge_build_failures(backend.failure(), frontend.failure()) {
            return self.short_circuit(run_id, failure).await;
        }

        let (Some(StageOutput::Image(backend_image)), Some(StageOutput::Image(frontend_image))) =
            (backend.output, frontend.output)
        else {
            bail!("build succeeded without an image");
        };
        let built: BTreeMap<Component, ImageRef> = [
            (Component::Backend, backend_image.clone()),
            (Component::Frontend, frontend_image.clone()),
        ]
        .into_iter()
        .collect();

        // 3. test
        let test = self
            .run_with_retry(
                Stage::Test,
                StageOp::Test {
                    source: &source,
                    backend: &backend_image,
                },
                &ctx,
                &tracker,
                true,
            )
            .await?;
        if let Some(done) = self.settle(run_id, StageName::Test, &test, &tracker).await? {
            return Ok(done);
        }

        // 4. scan
        let images = [backend_image, frontend_image];
        let scan = self
            .run_with_retry(
                Stage::Scan,
                StageOp::Scan { images: &images },
                &ctx,
                &tracker,
                true,
            )
            .await?;
        if let Some(done) = self.settle(run_id, StageName::Scan, &scan, &tracker).await? {
            return Ok(done);
        }

        // The workspace is no longer needed once the gates have passed
        drop(source);

        // 5. deploy
        let mapping = target.mapping_for(&built);
        let previous = target.restorable(&mapping);
        let unrestorable = target.unrestorable(&mapping);
        let deploy = self
            .run_with_retry(
                Stage::Deploy,
                StageOp::Deploy {
                    target: &*target,
                    images: &mapping,
                },
                &ctx,
                &tracker,
                true,
            )
            .await?;
        if let Some(failure) = deploy.failure() {
            return self.short_circuit(run_id, failure).await;
        }
        target.promote(&mapping);
        info!(services = mapping.len(), "Target now serves the new images");

        // 6. verify; from here on cancellation waits for verify/rollback
        let verify = self
            .run_with_retry(
                Stage::Verify,
                StageOp::Verify {
                    target: &*target,
                    deadline: self.settings.health.deadline(),
                },
                &ctx,
                &tracker,
                true,
            )
            .await?;

        match verify.failure() {
            None => self.finalize(run_id, RunState::Succeeded).await,
            Some(failure) => {
                self.roll_back(run_id, target, &previous, &unrestorable, &ctx, failure)
                    .await
            }
        }
    }

    /// Run a stage, retrying transient failures per the retry policy.
    ///
    /// With `record` set each attempt is appended to the store as soon as it
    /// finishes; otherwise the caller records them.
    async fn run_with_retry(
        &self,
        stage: Stage,
        op: StageOp<'_>,
        ctx: &StageContext,
        tracker: &RunTracker,
        record: bool,
    ) -> Result<StageRun> {
        let policy = &self.settings.retry;
        let base_timeout = self.settings.stage_timeout(stage.name());
        let mut attempts = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Stages that run after deploy are not cut short by the budget
            let timeout = if stage.name() < StageName::Deploy {
                tracker.clamp(base_timeout)
            } else {
                base_timeout
            };

            let executed = self.executor.run(op, &ctx.attempt(attempt), timeout).await;
            let failure = executed.result.failure;
            if record {
                self.store
                    .append_stage(ctx.run_id, executed.result.clone())
                    .await?;
            }
            attempts.push(executed.result);

            let Some(class) = failure else {
                return Ok(StageRun {
                    attempts,
                    output: executed.output,
                });
            };

            let retry = class.is_retryable()
                && stage.retryable()
                && policy.should_retry(attempt)
                && tracker.check().is_ok();

            if !retry {
                if class.is_retryable() && stage.retryable() {
                    error!(stage = %stage.name(), attempt, "Stage failed after retries");
                }
                return Ok(StageRun {
                    attempts,
                    output: None,
                });
            }

            let delay = policy.delay_for_attempt(attempt).min(tracker.remaining());
            warn!(
                stage = %stage.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Stage failed transiently, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Decide what happens after a pre-deploy stage
    async fn settle(
        &self,
        run_id: Uuid,
        stage: StageName,
        outcome: &StageRun,
        tracker: &RunTracker,
    ) -> Result<Option<PipelineRun>> {
        if let Err(violation) = tracker.check() {
            return self.cancel(run_id, Some(stage), violation).await.map(Some);
        }
        match outcome.failure() {
            Some(failure) => self.short_circuit(run_id, failure).await.map(Some),
            None => Ok(None),
        }
    }

    /// Record every stage after the last recorded one as Skipped, then fail the run
    async fn short_circuit(&self, run_id: Uuid, failure: RunFailure) -> Result<PipelineRun> {
        let run = self.store.get(run_id).await?;
        let last = run
            .stages
            .last()
            .map(|s| s.name)
            .or(failure.stage)
            .unwrap_or(StageName::Checkout);

        for name in last.following() {
            let blocked_by = Stage::from_name(name)
                .predecessors()
                .iter()
                .copied()
                .find(|p| !run.is_stage_successful(*p))
                .unwrap_or(last);
            let reason = format!("predecessor '{}' did not succeed", blocked_by);
            self.store
                .append_stage(run_id, StageResult::skipped(name, reason))
                .await?;
        }

        warn!(
            stage = ?failure.stage,
            class = %failure.class,
            message = %failure.message,
            "Run stopped"
        );
        self.store.record_failure(run_id, failure).await?;
        self.finalize(run_id, RunState::Failed).await
    }

    /// Stop at a stage boundary because of cancellation or the run budget
    async fn cancel(
        &self,
        run_id: Uuid,
        after: Option<StageName>,
        violation: BudgetViolation,
    ) -> Result<PipelineRun> {
        warn!(after = ?after, reason = %violation, "Run cancelled at stage boundary");
        self.store
            .record_failure(
                run_id,
                RunFailure {
                    stage: after,
                    class: FailureClass::Cancelled,
                    message: violation.to_string(),
                },
            )
            .await?;
        self.finalize(run_id, RunState::Failed).await
    }

    /// Restore the previous images after a failed verify (exactly one attempt).
    ///
    /// Services that received their first image in this run have nothing to
    /// go back to; they keep serving it and the run ends Failed with an alarm
    /// naming them.
    async fn roll_back(
        &self,
        run_id: Uuid,
        target: &mut DeploymentTarget,
        previous: &ImageSet,
        unrestorable: &[String],
        ctx: &StageContext,
        failure: RunFailure,
    ) -> Result<PipelineRun> {
        warn!(message = %failure.message, "Verify failed, rolling back");
        self.store.record_failure(run_id, failure).await?;

        if previous.is_empty() {
            error!("Verify failed and there is nothing to roll back to");
            self.store.raise_alarm(run_id, NO_PREVIOUS_IMAGES).await?;
            return self.finalize(run_id, RunState::Failed).await;
        }

        let rollback = self
            .executor
            .run(
                StageOp::Deploy {
                    target: &*target,
                    images: previous,
                },
                &ctx.attempt(1),
                self.settings.stage_timeout(StageName::Deploy),
            )
            .await;
        let restored = rollback.result.is_success();
        let message = rollback.result.error_message();
        self.store.record_rollback(run_id, rollback.result).await?;

        if restored {
            target.promote(previous);
            info!(services = previous.len(), "Previous images restored");
            if unrestorable.is_empty() {
                return self.finalize(run_id, RunState::RolledBack).await;
            }

            let alarm = format!(
                "{} {} on target '{}': still serving this run's images",
                NOT_RESTORED,
                unrestorable.join(", "),
                target.name
            );
            error!(%alarm, "Rollback incomplete");
            self.store.raise_alarm(run_id, alarm).await?;
            return self.finalize(run_id, RunState::Failed).await;
        }

        let alarm = format!(
            "rollback deploy failed ({}); target '{}' left in last-known state",
            message.unwrap_or_else(|| "unknown error".to_string()),
            target.name
        );
        error!(%alarm, "Operator intervention required");
        self.store.raise_alarm(run_id, alarm).await?;
        self.finalize(run_id, RunState::Failed).await
    }

    /// Move the run to its terminal state and emit the single notification
    async fn finalize(&self, run_id: Uuid, state: RunState) -> Result<PipelineRun> {
        let run = match self.store.set_state(run_id, state).await {
            Ok(run) => run,
            Err(e) if e.is_consistency() => {
                error!(error = %e, "Invariant violation: terminal state overwrite rejected");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        info!(state = %run.state, stages = run.stages.len(), "Run finished");
        self.notify(&run).await;

        Ok(run)
    }

    /// Fail a run whose execution returned an error and emit its notification.
    ///
    /// Returns None when the run is unknown or already finished.
    pub async fn abort(&self, run_id: Uuid, cause: &anyhow::Error) -> Option<PipelineRun> {
        let stage = match self.store.get(run_id).await {
            Ok(run) => run.stages.last().map(|s| s.name),
            Err(_) => None,
        };
        let failure = RunFailure {
            stage,
            class: FailureClass::Fatal,
            message: format!("run aborted: {:#}", cause),
        };

        match self.store.abandon(run_id, failure).await {
            Ok(run) => {
                error!(%run_id, error = %cause, "Run aborted and closed as failed");
                self.notify(&run).await;
                Some(run)
            }
            Err(e) => {
                warn!(%run_id, error = %e, "Could not close aborted run");
                None
            }
        }
    }

    /// Close runs left unfinished by a previous process, notifying each
    pub async fn close_interrupted(&self) -> Result<Vec<PipelineRun>> {
        let closed = self.store.close_interrupted().await?;
        for run in &closed {
            self.notify(run).await;
        }
        Ok(closed)
    }

    async fn notify(&self, run: &PipelineRun) {
        let notification = RunNotification::from_run(run);
        if let Err(e) = self.sink.notify(&notification).await {
            warn!(sink = self.sink.name(), error = %e, "Failed to deliver notification");
        }
    }
}

/// Both builds are reported; the run stops at the first failing one
fn merge_build_failures(
    backend: Option<RunFailure>,
    frontend: Option<RunFailure>,
) -> Option<RunFailure> {
    match (backend, frontend) {
        (Some(mut backend), Some(frontend)) => {
            backend.message = format!("{}; {}", backend.message, frontend.message);
            Some(backend)
        }
        (backend, frontend) => backend.or(frontend),
    }
}

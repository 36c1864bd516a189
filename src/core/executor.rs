//! Stage Executor: runs one stage attempt under a hard timeout.
//!
//! Each stage kind has a typed operation (`StageOp`) and a typed output
//! (`StageOutput`). Collaborator errors are classified into the failure
//! taxonomy here; nothing but a `StageResult` leaves an attempt.
//!
//! Images are built under an attempt-qualified tag and only re-tagged to the
//! run's canonical reference once the attempt succeeds, so a failed or
//! timed-out attempt can never be mistaken for a successful one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::health_gate::{HealthGate, Verdict};
use super::pipeline::PipelineSettings;
use crate::adapters::{BuildRequest, CollaboratorError, Collaborators, SourceTree};
use crate::domain::{
    Component, DeploymentTarget, FailureClass, Finding, ImageRef, ImageSet, Severity, StageName,
    StageResult,
};

/// Bound on best-effort cleanup after a cancelled attempt
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Dockerfile target that layers the test suite on top of the backend image
const TEST_TARGET: &str = "test";

/// The operation performed by one stage
#[derive(Debug, Clone, Copy)]
pub enum StageOp<'a> {
    Checkout {
        repository: &'a str,
        commit: &'a str,
    },
    Build {
        component: Component,
        source: &'a SourceTree,
    },
    Test {
        source: &'a SourceTree,
        backend: &'a ImageRef,
    },
    Scan {
        images: &'a [ImageRef],
    },
    Deploy {
        target: &'a DeploymentTarget,
        images: &'a ImageSet,
    },
    Verify {
        target: &'a DeploymentTarget,
        deadline: Duration,
    },
}

impl StageOp<'_> {
    pub fn name(&self) -> StageName {
        match self {
            StageOp::Checkout { .. } => StageName::Checkout,
            StageOp::Build { component, .. } => component.build_stage(),
            StageOp::Test { .. } => StageName::Test,
            StageOp::Scan { .. } => StageName::Scan,
            StageOp::Deploy { .. } => StageName::Deploy,
            StageOp::Verify { .. } => StageName::Verify,
        }
    }
}

/// Typed output of a successful stage
#[derive(Debug)]
pub enum StageOutput {
    Source(SourceTree),
    Image(ImageRef),
    Tested,
    Scanned,
    Deployed,
    Verified,
}

/// Identity of the attempt being executed
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub commit: String,
    pub attempt: u32,
}

impl StageContext {
    pub fn new(run_id: Uuid, commit: impl Into<String>) -> Self {
        Self {
            run_id,
            commit: commit.into(),
            attempt: 1,
        }
    }

    /// The same context for another attempt
    pub fn attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// One executed attempt
#[derive(Debug)]
pub struct Attempt {
    pub result: StageResult,

    /// Present only when the attempt succeeded
    pub output: Option<StageOutput>,
}

/// A classified stage failure
struct StageFailure {
    class: FailureClass,
    detail: serde_json::Value,
}

impl StageFailure {
    fn new(class: FailureClass, detail: serde_json::Value) -> Self {
        Self { class, detail }
    }

    fn policy(detail: serde_json::Value) -> Self {
        Self::new(FailureClass::Policy, detail)
    }
}

impl From<CollaboratorError> for StageFailure {
    fn from(err: CollaboratorError) -> Self {
        let class = if err.is_transient() {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        };
        Self::new(class, json!({ "error": err.to_string() }))
    }
}

type StageOutcome = Result<(StageOutput, serde_json::Value), StageFailure>;

/// Executes stage attempts against the collaborators
pub struct StageExecutor {
    collaborators: Collaborators,
    health_gate: HealthGate,
    image_repository: String,
    test_command: Vec<String>,
    severity_threshold: Severity,
}

impl StageExecutor {
    pub fn new(collaborators: Collaborators, settings: &PipelineSettings) -> Self {
        Self {
            health_gate: HealthGate::new(Arc::clone(&collaborators.runtime), &settings.health),
            collaborators,
            image_repository: settings.image_repository.clone(),
            test_command: settings.test_command.clone(),
            severity_threshold: settings.severity_threshold,
        }
    }

    /// Run one attempt of a stage under `timeout`.
    ///
    /// On timeout the operation is dropped (killing any subprocess it owns),
    /// its attempt-qualified artifacts are discarded, and the attempt is
    /// classified as transient.
    pub async fn run(&self, op: StageOp<'_>, ctx: &StageContext, timeout: Duration) -> Attempt {
        let name = op.name();
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();

        let outcome = tokio::time::timeout(timeout, self.perform(op, ctx)).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok((output, detail))) => Attempt {
                result: StageResult::success(name, ctx.attempt, detail)
                    .with_timing(started_at, duration_ms),
                output: Some(output),
            },
            Ok(Err(failure)) => Attempt {
                result: StageResult::failure(name, ctx.attempt, failure.class, failure.detail)
                    .with_timing(started_at, duration_ms),
                output: None,
            },
            Err(_) => {
                warn!(
                    stage = %name,
                    attempt = ctx.attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    "Stage attempt timed out"
                );
                self.discard_attempt(op, ctx).await;
                Attempt {
                    result: StageResult::failure(
                        name,
                        ctx.attempt,
                        FailureClass::Transient,
                        json!({
                            "error": format!("timed out after {}ms", timeout.as_millis()),
                            "timeout_ms": timeout.as_millis() as u64,
                        }),
                    )
                    .with_timing(started_at, duration_ms),
                    output: None,
                }
            }
        }
    }

    async fn perform(&self, op: StageOp<'_>, ctx: &StageContext) -> StageOutcome {
        match op {
            StageOp::Checkout { repository, commit } => self.checkout(repository, commit).await,
            StageOp::Build { component, source } => self.build(component, source, ctx).await,
            StageOp::Test { source, backend } => self.test(source, backend, ctx).await,
            StageOp::Scan { images } => self.scan(images).await,
            StageOp::Deploy { target, images } => self.deploy(target, images).await,
            StageOp::Verify { target, deadline } => self.verify(target, deadline).await,
        }
    }

    async fn checkout(&self, repository: &str, commit: &str) -> StageOutcome {
        // A missing or invalid revision cannot be retried away
        let tree = self
            .collaborators
            .source
            .checkout(repository, commit)
            .await
            .map_err(|e| {
                StageFailure::new(FailureClass::Fatal, json!({ "error": e.to_string() }))
            })?;

        let detail = json!({
            "commit": tree.commit,
            "path": tree.path.display().to_string(),
        });
        Ok((StageOutput::Source(tree), detail))
    }

    fn attempt_tag(&self, image: &str, stage: StageName, ctx: &StageContext) -> ImageRef {
        ImageRef::attempt(
            &self.image_repository,
            image,
            &ctx.commit,
            ctx.run_id,
            stage,
            ctx.attempt,
        )
    }

    /// Tag used for the throwaway test image
    fn test_tag(&self, ctx: &StageContext) -> ImageRef {
        self.attempt_tag("backend-test", StageName::Test, ctx)
    }

    async fn build(
        &self,
        component: Component,
        source: &SourceTree,
        ctx: &StageContext,
    ) -> StageOutcome {
        let builder = &self.collaborators.builder;
        let attempt_tag = self.attempt_tag(component.name(), component.build_stage(), ctx);
        let canonical = ImageRef::canonical(
            &self.image_repository,
            component.name(),
            &ctx.commit,
            ctx.run_id,
        );

        let request = BuildRequest {
            context: &source.path,
            target: component.dockerfile_target(),
            tag: &attempt_tag,
            args: Vec::new(),
            no_cache: false,
        };

        let built = match builder.build(request).await {
            Ok(built) => built,
            Err(e) => {
                self.remove_quietly(&attempt_tag).await;
                return Err(e.into());
            }
        };

        if let Err(e) = builder.tag(&built, &canonical).await {
            self.remove_quietly(&attempt_tag).await;
            return Err(e.into());
        }
        self.remove_quietly(&attempt_tag).await;

        let detail = json!({
            "component": component.name(),
            "image": canonical,
        });
        Ok((StageOutput::Image(canonical), detail))
    }

    async fn test(
        &self,
        source: &SourceTree,
        backend: &ImageRef,
        ctx: &StageContext,
    ) -> StageOutcome {
        let test_tag = self.test_tag(ctx);

        // Always a fresh image layered on this run's backend build
        let request = BuildRequest {
            context: &source.path,
            target: TEST_TARGET,
            tag: &test_tag,
            args: vec![("BASE_IMAGE".to_string(), backend.to_string())],
            no_cache: true,
        };

        if let Err(e) = self.collaborators.builder.build(request).await {
            self.remove_quietly(&test_tag).await;
            return Err(e.into());
        }

        let report = self
            .collaborators
            .runtime
            .run_once(&test_tag, &self.test_command)
            .await;
        self.remove_quietly(&test_tag).await;
        let report = report?;

        if report.code != 0 {
            return Err(StageFailure::policy(json!({
                "error": format!("test suite exited with status {}", report.code),
                "exit_code": report.code,
                "log": report.output,
            })));
        }

        let detail = json!({
            "exit_code": report.code,
            "log": report.output,
            "base_image": backend,
        });
        Ok((StageOutput::Tested, detail))
    }

    async fn scan(&self, images: &[ImageRef]) -> StageOutcome {
        let mut by_image = BTreeMap::new();
        let mut all = Vec::new();

        for image in images {
            let findings = self.collaborators.scanner.scan(image).await?;
            all.extend(findings.iter().cloned());
            by_image.insert(image.to_string(), findings);
        }

        let blocking: Vec<&Finding> = all
            .iter()
            .filter(|f| f.severity >= self.severity_threshold)
            .collect();

        let detail = json!({
            "threshold": self.severity_threshold,
            "findings": by_image,
            "blocking": blocking,
        });

        if !blocking.is_empty() {
            let mut detail = detail;
            detail["error"] = json!(format!(
                "{} finding(s) at or above {}",
                blocking.len(),
                self.severity_threshold
            ));
            return Err(StageFailure::policy(detail));
        }

        Ok((StageOutput::Scanned, detail))
    }

    async fn deploy(&self, target: &DeploymentTarget, images: &ImageSet) -> StageOutcome {
        self.collaborators.runtime.apply(target, images).await?;

        let detail = json!({
            "target": target.name,
            "services": images,
        });
        Ok((StageOutput::Deployed, detail))
    }

    async fn verify(&self, target: &DeploymentTarget, deadline: Duration) -> StageOutcome {
        let report = self.health_gate.verify(target, deadline).await;
        let mut detail = serde_json::to_value(&report).unwrap_or_default();

        match report.verdict {
            Verdict::Healthy => Ok((StageOutput::Verified, detail)),
            Verdict::Unhealthy => {
                detail["error"] = json!(format!("target unhealthy after {} polls", report.polls));
                Err(StageFailure::policy(detail))
            }
            Verdict::TimedOut => {
                detail["error"] = json!(format!(
                    "target not healthy within {}s",
                    deadline.as_secs()
                ));
                Err(StageFailure::policy(detail))
            }
        }
    }

    /// Remove artifacts left behind by a cancelled attempt
    async fn discard_attempt(&self, op: StageOp<'_>, ctx: &StageContext) {
        let tag = match op {
            StageOp::Build { component, .. } => {
                self.attempt_tag(component.name(), component.build_stage(), ctx)
            }
            StageOp::Test { .. } => self.test_tag(ctx),
            _ => return,
        };

        if tokio::time::timeout(CLEANUP_TIMEOUT, self.remove_quietly(&tag))
            .await
            .is_err()
        {
            warn!(image = %tag, "Timed out discarding attempt image");
        }
    }

    async fn remove_quietly(&self, image: &ImageRef) {
        if let Err(e) = self.collaborators.builder.remove(image).await {
            debug!(image = %image, error = %e, "Image removal failed");
        }
    }
}

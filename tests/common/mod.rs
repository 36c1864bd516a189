//! Scripted fake collaborators shared by the integration tests.
//!
//! Each fake replays a per-call script and records what it was asked to do.
//! An exhausted script falls back to success.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use shipgate::adapters::{
    BuildRequest, CollaboratorError, Collaborators, ContainerRuntime, ExitReport, ImageBuilder,
    ImageScanner, ServiceHealth, SourceControl, SourceTree,
};
use shipgate::core::budget::RunTracker;
use shipgate::core::notify::{ChannelSink, RunNotification};
use shipgate::core::{PipelineEngine, PipelineSettings, RunStore};
use shipgate::domain::{
    Component, DeploymentTarget, Finding, ImageRef, ImageSet, PipelineRun, RunOrigin, ServiceSpec,
};

pub const COMMIT: &str = "3f2c1e9a7b4d5e6f";
pub const REPOSITORY: &str = "https://git.example.com/shop/app.git";

/// One scripted collaborator response
#[derive(Debug, Clone)]
pub enum Step {
    Ok,
    Fail(CollaboratorError),
    /// Never completes; only a timeout ends it
    Hang,
}

impl Step {
    pub fn unavailable(msg: &str) -> Self {
        Step::Fail(CollaboratorError::Unavailable(msg.to_string()))
    }

    pub fn rejected(msg: &str) -> Self {
        Step::Fail(CollaboratorError::Rejected(msg.to_string()))
    }

    async fn play(self) -> Result<(), CollaboratorError> {
        match self {
            Step::Ok => Ok(()),
            Step::Fail(e) => Err(e),
            Step::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

// ============================================================================
// Source control
// ============================================================================

#[derive(Default)]
pub struct FakeSource {
    script: Mutex<VecDeque<Step>>,
    pub checkouts: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        lock(&self.script).extend(steps);
    }

    pub fn checkout_count(&self) -> usize {
        lock(&self.checkouts).len()
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    fn name(&self) -> &str {
        "fake-git"
    }

    async fn checkout(
        &self,
        _repository: &str,
        commit: &str,
    ) -> Result<SourceTree, CollaboratorError> {
        lock(&self.checkouts).push(commit.to_string());
        let step = lock(&self.script).pop_front().unwrap_or(Step::Ok);
        step.play().await?;
        Ok(SourceTree::at(commit, "/tmp/shipgate-fake-src"))
    }
}

// ============================================================================
// Image builder
// ============================================================================

/// A recorded build call
#[derive(Debug, Clone)]
pub struct BuildCall {
    pub target: String,
    pub tag: ImageRef,
    pub no_cache: bool,
    pub args: Vec<(String, String)>,
}

/// Builder scripted per dockerfile target ("backend", "frontend", "test")
#[derive(Default)]
pub struct ScriptedBuilder {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    pub builds: Mutex<Vec<BuildCall>>,
    pub tags: Mutex<Vec<(ImageRef, ImageRef)>>,
    pub removed: Mutex<Vec<ImageRef>>,
}

impl ScriptedBuilder {
    pub fn script(&self, target: &str, steps: impl IntoIterator<Item = Step>) {
        lock(&self.scripts)
            .entry(target.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn builds_for(&self, target: &str) -> Vec<BuildCall> {
        lock(&self.builds)
            .iter()
            .filter(|b| b.target == target)
            .cloned()
            .collect()
    }

    pub fn removed(&self) -> Vec<ImageRef> {
        lock(&self.removed).clone()
    }

    pub fn tags(&self) -> Vec<(ImageRef, ImageRef)> {
        lock(&self.tags).clone()
    }
}

#[async_trait]
impl ImageBuilder for ScriptedBuilder {
    fn name(&self) -> &str {
        "scripted-builder"
    }

    async fn build(&self, request: BuildRequest<'_>) -> Result<ImageRef, CollaboratorError> {
        lock(&self.builds).push(BuildCall {
            target: request.target.to_string(),
            tag: request.tag.clone(),
            no_cache: request.no_cache,
            args: request.args.clone(),
        });
        let step = lock(&self.scripts)
            .get_mut(request.target)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok);
        step.play().await?;
        Ok(request.tag.clone())
    }

    async fn tag(
        &self,
        source: &ImageRef,
        destination: &ImageRef,
    ) -> Result<(), CollaboratorError> {
        lock(&self.tags).push((source.clone(), destination.clone()));
        Ok(())
    }

    async fn remove(&self, image: &ImageRef) -> Result<(), CollaboratorError> {
        lock(&self.removed).push(image.clone());
        Ok(())
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// Scanner returning fixed findings per component
#[derive(Default)]
pub struct FakeScanner {
    findings: Mutex<HashMap<Component, Vec<Finding>>>,
    pub scanned: Mutex<Vec<ImageRef>>,
}

impl FakeScanner {
    pub fn report(&self, component: Component, findings: Vec<Finding>) {
        lock(&self.findings).insert(component, findings);
    }
}

#[async_trait]
impl ImageScanner for FakeScanner {
    fn name(&self) -> &str {
        "fake-scanner"
    }

    async fn scan(&self, image: &ImageRef) -> Result<Vec<Finding>, CollaboratorError> {
        lock(&self.scanned).push(image.clone());
        let findings = lock(&self.findings);
        let component = Component::ALL
            .into_iter()
            .find(|c| image.as_str().contains(&format!("/{}:", c.name())));
        Ok(component
            .and_then(|c| findings.get(&c).cloned())
            .unwrap_or_default())
    }
}

// ============================================================================
// Container runtime
// ============================================================================

/// Runtime with scripted apply/run_once calls and per-service health.
///
/// A service's health script repeats its last entry; unscripted services
/// are always up.
#[derive(Default)]
pub struct FakeRuntime {
    apply_script: Mutex<VecDeque<Step>>,
    exit_codes: Mutex<VecDeque<i32>>,
    health: Mutex<HashMap<String, VecDeque<ServiceHealth>>>,
    pub applied: Mutex<Vec<ImageSet>>,
    pub test_runs: Mutex<Vec<ImageRef>>,
    pub probes: Mutex<usize>,
}

impl FakeRuntime {
    pub fn script_apply(&self, steps: impl IntoIterator<Item = Step>) {
        lock(&self.apply_script).extend(steps);
    }

    pub fn script_exit_codes(&self, codes: impl IntoIterator<Item = i32>) {
        lock(&self.exit_codes).extend(codes);
    }

    pub fn script_health(&self, service: &str, health: impl IntoIterator<Item = ServiceHealth>) {
        lock(&self.health)
            .entry(service.to_string())
            .or_default()
            .extend(health);
    }

    pub fn applied(&self) -> Vec<ImageSet> {
        lock(&self.applied).clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake-runtime"
    }

    async fn apply(
        &self,
        _target: &DeploymentTarget,
        images: &ImageSet,
    ) -> Result<(), CollaboratorError> {
        let step = lock(&self.apply_script).pop_front().unwrap_or(Step::Ok);
        step.play().await?;
        lock(&self.applied).push(images.clone());
        Ok(())
    }

    async fn run_once(
        &self,
        image: &ImageRef,
        _command: &[String],
    ) -> Result<ExitReport, CollaboratorError> {
        lock(&self.test_runs).push(image.clone());
        let code = lock(&self.exit_codes).pop_front().unwrap_or(0);
        Ok(ExitReport {
            code,
            output: format!("exit {}", code),
        })
    }

    async fn health_of(&self, service: &ServiceSpec) -> ServiceHealth {
        *lock(&self.probes) += 1;
        let mut health = lock(&self.health);
        match health.get_mut(&service.name) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(ServiceHealth::Up),
            Some(script) => script.front().copied().unwrap_or(ServiceHealth::Up),
            None => ServiceHealth::Up,
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// The staging target: two application services and their database
pub fn staging() -> DeploymentTarget {
    DeploymentTarget::new(
        "staging",
        vec![
            ServiceSpec {
                name: "api".to_string(),
                component: Some(Component::Backend),
                health_endpoint: Some("http://api:8000/health".to_string()),
            },
            ServiceSpec {
                name: "web".to_string(),
                component: Some(Component::Frontend),
                health_endpoint: Some("http://web:3000/".to_string()),
            },
            ServiceSpec {
                name: "db".to_string(),
                component: None,
                health_endpoint: None,
            },
        ],
    )
}

/// Images the staging target served before the run under test
pub fn previous_images() -> ImageSet {
    [
        ("api".to_string(), ImageRef::new("shipgate.local/backend:old")),
        ("web".to_string(), ImageRef::new("shipgate.local/frontend:old")),
    ]
    .into_iter()
    .collect()
}

pub fn origin(commit: &str) -> RunOrigin {
    RunOrigin {
        commit_ref: commit.to_string(),
        branch: "main".to_string(),
        repository: REPOSITORY.to_string(),
        delivery_id: None,
        target: "staging".to_string(),
    }
}

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub builder: Arc<ScriptedBuilder>,
    pub scanner: Arc<FakeScanner>,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<RunStore>,
    pub engine: Arc<PipelineEngine>,
    pub notifications: UnboundedReceiver<RunNotification>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(PipelineSettings::default())
    }

    pub fn with_settings(settings: PipelineSettings) -> Self {
        Self::with_store(settings, Arc::new(RunStore::in_memory()))
    }

    /// A harness whose engine records into `store`
    pub fn with_store(settings: PipelineSettings, store: Arc<RunStore>) -> Self {
        let source = Arc::new(FakeSource::default());
        let builder = Arc::new(ScriptedBuilder::default());
        let scanner = Arc::new(FakeScanner::default());
        let runtime = Arc::new(FakeRuntime::default());
        let (sink, notifications) = ChannelSink::new();

        let collaborators = Collaborators {
            source: source.clone(),
            builder: builder.clone(),
            scanner: scanner.clone(),
            runtime: runtime.clone(),
        };
        let engine = Arc::new(PipelineEngine::new(
            Arc::clone(&store),
            collaborators,
            settings,
            Arc::new(sink),
        ));

        Self {
            source,
            builder,
            scanner,
            runtime,
            store,
            engine,
            notifications,
        }
    }

    /// Register a pending run for `commit`
    pub async fn pending(&self, commit: &str) -> Uuid {
        let run = PipelineRun::new(origin(commit));
        self.store.create(&run).await.unwrap()
    }

    /// Create and execute a run without budget or cancellation
    pub async fn run(&self, target: &mut DeploymentTarget) -> PipelineRun {
        let run_id = self.pending(COMMIT).await;
        self.engine
            .execute(run_id, target, RunTracker::unbounded())
            .await
            .unwrap()
    }
}

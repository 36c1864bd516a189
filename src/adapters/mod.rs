//! Adapter interfaces for external collaborators.
//!
//! The pipeline never builds, scans or runs containers itself. It drives
//! four collaborators through the traits below:
//! - `SourceControl`: fetch a revision into a build context
//! - `ImageBuilder`: build/tag/remove images
//! - `ImageScanner`: list vulnerability findings for an image
//! - `ContainerRuntime`: apply an image set, run one-off containers, report health

pub mod docker;
pub mod git;
pub mod trivy;

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;

use crate::domain::{DeploymentTarget, Finding, ImageRef, ImageSet, ServiceSpec};

pub use docker::{DockerBuilder, DockerRuntime};
pub use git::GitCheckout;
pub use trivy::TrivyScanner;

/// Error reported by a collaborator
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// The collaborator could not be reached; worth retrying
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator ran and refused the request
    #[error("{0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable(_))
    }
}

/// A checked-out revision ready to be used as a build context
#[derive(Debug)]
pub struct SourceTree {
    pub commit: String,
    pub path: PathBuf,
    _workspace: Option<TempDir>,
}

impl SourceTree {
    /// A source tree at an existing path (not cleaned up on drop)
    pub fn at(commit: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            commit: commit.into(),
            path: path.into(),
            _workspace: None,
        }
    }

    /// A source tree that owns its workspace; removed when dropped
    pub fn owned(commit: impl Into<String>, workspace: TempDir) -> Self {
        Self {
            commit: commit.into(),
            path: workspace.path().to_path_buf(),
            _workspace: Some(workspace),
        }
    }
}

/// Parameters for one image build
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    /// Build context directory
    pub context: &'a Path,

    /// Dockerfile target stage
    pub target: &'a str,

    /// Tag to apply to the result
    pub tag: &'a ImageRef,

    /// Build arguments
    pub args: Vec<(String, String)>,

    /// Ignore any layer cache
    pub no_cache: bool,
}

/// Exit status and output of a one-off container
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub code: i32,
    pub output: String,
}

/// Health reported for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    /// Application and its dependencies are reachable
    Up,

    /// Application unreachable or reporting failure
    Down,

    /// Application reachable, a dependency is not (yet)
    Degraded,
}

/// Fetches source revisions
#[async_trait]
pub trait SourceControl: Send + Sync {
    fn name(&self) -> &str;

    async fn checkout(&self, repository: &str, commit: &str)
        -> Result<SourceTree, CollaboratorError>;
}

/// Builds and manages container images
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    fn name(&self) -> &str;

    async fn build(&self, request: BuildRequest<'_>) -> Result<ImageRef, CollaboratorError>;

    async fn tag(&self, source: &ImageRef, destination: &ImageRef)
        -> Result<(), CollaboratorError>;

    async fn remove(&self, image: &ImageRef) -> Result<(), CollaboratorError>;
}

/// Scans images for vulnerabilities
#[async_trait]
pub trait ImageScanner: Send + Sync {
    fn name(&self) -> &str;

    /// Findings ordered by severity, most severe first
    async fn scan(&self, image: &ImageRef) -> Result<Vec<Finding>, CollaboratorError>;
}

/// Runs containers on the deployment platform
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Atomically switch the target's services to the given images
    async fn apply(
        &self,
        target: &DeploymentTarget,
        images: &ImageSet,
    ) -> Result<(), CollaboratorError>;

    /// Run a throwaway container to completion
    async fn run_once(
        &self,
        image: &ImageRef,
        command: &[String],
    ) -> Result<ExitReport, CollaboratorError>;

    async fn health_of(&self, service: &ServiceSpec) -> ServiceHealth;
}

/// The full set of collaborators a pipeline needs
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceControl>,
    pub builder: Arc<dyn ImageBuilder>,
    pub scanner: Arc<dyn ImageScanner>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

/// Run a subprocess and capture its output.
///
/// Spawn failures are reported as `Unavailable` since the tool itself is missing
/// or not runnable right now. The child is killed if the future is dropped.
pub(crate) async fn run_captured(
    command: &mut Command,
    what: &str,
) -> Result<Output, CollaboratorError> {
    command.kill_on_drop(true);
    command
        .output()
        .await
        .map_err(|e| CollaboratorError::Unavailable(format!("failed to run {}: {}", what, e)))
}

/// Last `max` bytes of a log, on a char boundary
pub(crate) fn tail(output: &str, max: usize) -> String {
    if output.len() <= max {
        return output.to_string();
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}

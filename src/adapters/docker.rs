//! Docker-backed image builder and container runtime.
//!
//! Both adapters shell out to the `docker` CLI. Deployment uses
//! `docker compose`, with each service's image passed through an
//! `<SERVICE>_IMAGE` environment variable referenced by the compose file.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::debug;

use super::{
    run_captured, tail, BuildRequest, CollaboratorError, ContainerRuntime, ExitReport,
    ImageBuilder, ServiceHealth,
};
use crate::domain::{DeploymentTarget, ImageRef, ImageSet, ServiceSpec};

/// Maximum bytes of subprocess output kept in diagnostics
const LOG_EXCERPT_BYTES: usize = 4096;

/// Classify a failed docker invocation from its stderr
fn classify(what: &str, stderr: &str) -> CollaboratorError {
    let message = format!("{} failed: {}", what, tail(stderr.trim(), LOG_EXCERPT_BYTES));
    if stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
    {
        CollaboratorError::Unavailable(message)
    } else {
        CollaboratorError::Rejected(message)
    }
}

/// Image builder using `docker build`
pub struct DockerBuilder {
    binary_path: String,
}

impl Default for DockerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerBuilder {
    pub fn new() -> Self {
        Self::with_binary_path("docker")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    fn build_args(request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--target".to_string(),
            request.target.to_string(),
            "--tag".to_string(),
            request.tag.to_string(),
        ];
        if request.no_cache {
            args.push("--no-cache".to_string());
        }
        for (key, value) in &request.args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.context.display().to_string());
        args
    }
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    fn name(&self) -> &str {
        "docker"
    }

    async fn build(&self, request: BuildRequest<'_>) -> Result<ImageRef, CollaboratorError> {
        debug!(tag = %request.tag, target = request.target, "docker build");
        let output = run_captured(
            Command::new(&self.binary_path).args(Self::build_args(&request)),
            "docker build",
        )
        .await?;

        if !output.status.success() {
            return Err(classify(
                "docker build",
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        Ok(request.tag.clone())
    }

    async fn tag(
        &self,
        source: &ImageRef,
        destination: &ImageRef,
    ) -> Result<(), CollaboratorError> {
        let output = run_captured(
            Command::new(&self.binary_path).args(["tag", source.as_str(), destination.as_str()]),
            "docker tag",
        )
        .await?;

        if !output.status.success() {
            return Err(classify("docker tag", &String::from_utf8_lossy(&output.stderr)));
        }
        Ok(())
    }

    async fn remove(&self, image: &ImageRef) -> Result<(), CollaboratorError> {
        let output = run_captured(
            Command::new(&self.binary_path).args(["image", "rm", "--force", image.as_str()]),
            "docker image rm",
        )
        .await?;

        if !output.status.success() {
            return Err(classify(
                "docker image rm",
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }
}

/// Container runtime using `docker compose` and `docker run`
pub struct DockerRuntime {
    binary_path: String,
    project: String,
    compose_file: Option<PathBuf>,
    client: reqwest::Client,
}

impl DockerRuntime {
    pub fn new(project: impl Into<String>, compose_file: Option<PathBuf>) -> Self {
        Self {
            binary_path: "docker".to_string(),
            project: project.into(),
            compose_file,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_binary_path(mut self, binary_path: impl Into<String>) -> Self {
        self.binary_path = binary_path.into();
        self
    }

    /// Environment variable carrying a service's image (`api-gw` -> `API_GW_IMAGE`)
    pub fn image_variable(service: &str) -> String {
        let name: String = service
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_IMAGE", name)
    }

    fn compose_command(&self) -> Command {
        let mut command = Command::new(&self.binary_path);
        command.args(["compose", "--project-name", &self.project]);
        if let Some(ref file) = self.compose_file {
            command.arg("--file").arg(file);
        }
        command
    }
}

/// Body served by application health endpoints
#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,

    /// Dependency name -> status (e.g. `"database": "ok"`)
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

fn is_ok_status(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "ok" | "up" | "healthy" | "pass"
    )
}

/// Map an HTTP health response onto a service health
fn interpret_health(http_ok: bool, body: Option<HealthBody>) -> ServiceHealth {
    let Some(body) = body else {
        // Reachable but unparseable: trust the status code alone
        return if http_ok {
            ServiceHealth::Up
        } else {
            ServiceHealth::Down
        };
    };

    let dependencies_ok = body.dependencies.values().all(|s| is_ok_status(s));
    let app_ok = body.status.as_deref().map(is_ok_status).unwrap_or(http_ok);

    if !body.dependencies.is_empty() && !dependencies_ok {
        // The application answered, so it is up; a dependency is warming up or down
        ServiceHealth::Degraded
    } else if app_ok && http_ok {
        ServiceHealth::Up
    } else {
        ServiceHealth::Down
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker-compose"
    }

    async fn apply(
        &self,
        target: &DeploymentTarget,
        images: &ImageSet,
    ) -> Result<(), CollaboratorError> {
        let mut command = self.compose_command();
        command.args(["up", "--detach", "--no-build", "--wait"]);
        for (service, image) in images {
            command.env(Self::image_variable(service), image.as_str());
            command.arg(service);
        }
        debug!(deployment = %target.name, services = images.len(), "docker compose up");

        let output = run_captured(&mut command, "docker compose up").await?;
        if !output.status.success() {
            return Err(classify(
                "docker compose up",
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }

    async fn run_once(
        &self,
        image: &ImageRef,
        command: &[String],
    ) -> Result<ExitReport, CollaboratorError> {
        let output = run_captured(
            Command::new(&self.binary_path)
                .args(["run", "--rm", "--network", "none", image.as_str()])
                .args(command),
            "docker run",
        )
        .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        // 125: the docker CLI itself failed before the container ran
        if output.status.code() == Some(125) {
            return Err(classify("docker run", &stderr));
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&stderr);
        Ok(ExitReport {
            code: output.status.code().unwrap_or(-1),
            output: tail(&combined, LOG_EXCERPT_BYTES),
        })
    }

    async fn health_of(&self, service: &ServiceSpec) -> ServiceHealth {
        let Some(ref endpoint) = service.health_endpoint else {
            return ServiceHealth::Up;
        };

        let response = match self.client.get(endpoint).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(service = %service.name, error = %e, "health probe failed");
                return ServiceHealth::Down;
            }
        };

        let http_ok = response.status().is_success();
        let body = response.json::<HealthBody>().await.ok();
        interpret_health(http_ok, body)
    }
}

//! Configuration for shipgate.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHIPGATE_HOME, and the webhook secret variable)
//! 2. Config file (.shipgate/config.yaml)
//! 3. Defaults (~/.shipgate)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shipgate/config.yaml
//! - Relative paths in the file are relative to the project root (the
//!   directory containing .shipgate/)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::notify::SinkConfig;
use crate::core::pipeline::PipelineSettings;
use crate::domain::{DeploymentTarget, ServiceSpec};
use crate::trigger::TriggerSettings;

pub const CONFIG_DIR: &str = ".shipgate";
pub const CONFIG_FILE: &str = "config.yaml";
pub const HOME_ENV: &str = "SHIPGATE_HOME";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Engine state directory (relative to the project root)
    #[serde(default)]
    pub home: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub trigger: TriggerSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub notify: SinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Runs that may wait behind the one executing
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_bind() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_target_name")]
    pub name: String,

    /// docker compose project name
    #[serde(default = "default_project")]
    pub project: String,

    #[serde(default)]
    pub compose_file: Option<String>,

    /// Where checkouts are created
    #[serde(default)]
    pub workspaces: Option<String>,

    #[serde(default = "default_services")]
    pub services: Vec<ServiceSpec>,
}

fn default_target_name() -> String {
    "staging".to_string()
}

fn default_project() -> String {
    "shipgate-staging".to_string()
}

fn default_services() -> Vec<ServiceSpec> {
    use crate::domain::Component;

    vec![
        ServiceSpec {
            name: "backend".to_string(),
            component: Some(Component::Backend),
            health_endpoint: Some("http://localhost:8000/health".to_string()),
        },
        ServiceSpec {
            name: "frontend".to_string(),
            component: Some(Component::Frontend),
            health_endpoint: Some("http://localhost:3000/".to_string()),
        },
    ]
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: default_target_name(),
            project: default_project(),
            compose_file: None,
            workspaces: None,
            services: default_services(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to shipgate home (run logs, workspaces)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub server: ServerConfig,
    pub trigger: TriggerSettings,
    pub pipeline: PipelineSettings,
    pub target: TargetConfig,
    pub notify: SinkConfig,
    /// Compose file, resolved
    pub compose_file: Option<PathBuf>,
    /// Checkout directory, resolved
    pub workspaces: PathBuf,
}

impl ResolvedConfig {
    /// Run logs live under `<home>/runs`
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// The deployment target as described by the `target` section
    pub fn deployment_target(&self) -> DeploymentTarget {
        DeploymentTarget::new(self.target.name.clone(), self.target.services.clone())
    }

    /// Webhook secret from the environment; never read from the file
    pub fn webhook_secret(&self) -> Result<String> {
        std::env::var(&self.trigger.secret_env).with_context(|| {
            format!(
                "Webhook secret not set; export {}",
                self.trigger.secret_env
            )
        })
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    // An empty file is a valid config
    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration starting discovery from the current directory
pub fn load() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let home_override = std::env::var(HOME_ENV).ok().map(PathBuf::from);
    resolve(find_config_file(&cwd), home_override)
}

/// Load configuration from an explicit file
pub fn load_from(path: &Path) -> Result<ResolvedConfig> {
    let home_override = std::env::var(HOME_ENV).ok().map(PathBuf::from);
    resolve(Some(path.to_path_buf()), home_override)
}

fn resolve(config_file: Option<PathBuf>, home_override: Option<PathBuf>) -> Result<ResolvedConfig> {
    let (file, base_dir) = match config_file {
        Some(ref config_path) => {
            let file = load_config_file(config_path)?;
            // Base directory is the parent of .shipgate/ (i.e., grandparent of config.yaml)
            let base_dir = config_path
                .parent()
                .and_then(|p| p.parent())
                .unwrap_or(Path::new("."))
                .to_path_buf();
            (file, Some(base_dir))
        }
        None => (ConfigFile::default(), None),
    };

    file.pipeline
        .validate()
        .context("Invalid pipeline settings")?;

    let home = match (home_override, &file.home, &base_dir) {
        (Some(home), _, _) => home,
        (None, Some(home), Some(base)) => resolve_path(base, home),
        _ => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR),
    };

    let base = base_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let compose_file = file
        .target
        .compose_file
        .as_deref()
        .map(|p| resolve_path(&base, p));
    let workspaces = file
        .target
        .workspaces
        .as_deref()
        .map(|p| resolve_path(&base, p))
        .unwrap_or_else(|| home.join("workspaces"));

    Ok(ResolvedConfig {
        home,
        config_file,
        server: file.server,
        trigger: file.trigger,
        pipeline: file.pipeline,
        target: file.target,
        notify: file.notify,
        compose_file,
        workspaces,
    })
}

//! Images, scan findings and the deployment target.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::StageName;

/// Opaque reference to a built image (e.g. `registry/app:tag`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical reference owned by one run: `{repo}/{image}:{commit12}-{run8}`
    ///
    /// The run id is part of the tag, so two runs never share a reference even
    /// when they build byte-identical images.
    pub fn canonical(repository: &str, image: &str, commit: &str, run_id: Uuid) -> Self {
        Self(format!(
            "{}/{}:{}-{}",
            repository,
            image,
            short(commit, 12),
            short(&run_id.simple().to_string(), 8)
        ))
    }

    /// Attempt-qualified reference used while a stage attempt is in flight
    pub fn attempt(
        repository: &str,
        image: &str,
        commit: &str,
        run_id: Uuid,
        stage: StageName,
        attempt: u32,
    ) -> Self {
        let canonical = Self::canonical(repository, image, commit, run_id);
        Self(format!("{}-{}-a{}", canonical.0, stage.as_str(), attempt))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn short(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Service name -> image mapping served by a target
pub type ImageSet = BTreeMap<String, ImageRef>;

/// Buildable application component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Backend,
    Frontend,
}

impl Component {
    pub const ALL: [Component; 2] = [Component::Backend, Component::Frontend];

    pub fn name(&self) -> &'static str {
        match self {
            Component::Backend => "backend",
            Component::Frontend => "frontend",
        }
    }

    /// Dockerfile target that produces this component's image
    pub fn dockerfile_target(&self) -> &'static str {
        self.name()
    }

    /// Build stage that produces this component
    pub fn build_stage(&self) -> StageName {
        match self {
            Component::Backend => StageName::BuildBackend,
            Component::Frontend => StageName::BuildFrontend,
        }
    }
}

/// Vulnerability severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "unknown")]
    Unknown,
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "critical")]
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Unknown => "UNKNOWN",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(Severity::Unknown),
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// A single scanner finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub id: String,
}

impl Finding {
    pub fn new(severity: Severity, id: impl Into<String>) -> Self {
        Self {
            severity,
            id: id.into(),
        }
    }
}

/// One service of the deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    /// Component whose image this service runs (None for e.g. the database)
    #[serde(default)]
    pub component: Option<Component>,

    /// Health endpoint polled by the health gate
    #[serde(default)]
    pub health_endpoint: Option<String>,
}

/// The staging environment: a set of named services and the images they serve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub name: String,

    pub services: Vec<ServiceSpec>,

    /// Images currently served
    #[serde(default)]
    pub current: ImageSet,
}

impl DeploymentTarget {
    pub fn new(name: impl Into<String>, services: Vec<ServiceSpec>) -> Self {
        Self {
            name: name.into(),
            services,
            current: ImageSet::new(),
        }
    }

    /// Start from a known image set (e.g. what the environment runs today)
    pub fn with_current(mut self, current: ImageSet) -> Self {
        self.current = current;
        self
    }

    /// Map freshly built component images onto the services that run them
    pub fn mapping_for(&self, built: &BTreeMap<Component, ImageRef>) -> ImageSet {
        self.services
            .iter()
            .filter_map(|service| {
                let component = service.component?;
                built
                    .get(&component)
                    .map(|image| (service.name.clone(), image.clone()))
            })
            .collect()
    }

    /// Record that the target now serves `images`; returns the previous set
    pub fn promote(&mut self, images: &ImageSet) -> ImageSet {
        let previous = self.current.clone();
        for (service, image) in images {
            self.current.insert(service.clone(), image.clone());
        }
        previous
    }

    /// Previous images for exactly the services in `images`
    pub fn restorable(&self, images: &ImageSet) -> ImageSet {
        images
            .keys()
            .filter_map(|service| {
                self.current
                    .get(service)
                    .map(|image| (service.clone(), image.clone()))
            })
            .collect()
    }

    /// Services in `images` that had no image before; a rollback cannot restore them
    pub fn unrestorable(&self, images: &ImageSet) -> Vec<String> {
        images
            .keys()
            .filter(|service| !self.current.contains_key(*service))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DeploymentTarget {
        DeploymentTarget::new(
            "staging",
            vec![
                ServiceSpec {
                    name: "api".to_string(),
                    component: Some(Component::Backend),
                    health_endpoint: Some("http://localhost:8080/health".to_string()),
                },
                ServiceSpec {
                    name: "web".to_string(),
                    component: Some(Component::Frontend),
                    health_endpoint: None,
                },
                ServiceSpec {
                    name: "db".to_string(),
                    component: None,
                    health_endpoint: None,
                },
            ],
        )
    }

    #[test]
    fn test_canonical_refs_are_run_scoped() {
        let commit = "0123456789abcdef0123456789abcdef01234567";
        let a = ImageRef::canonical("registry.local", "backend", commit, Uuid::new_v4());
        let b = ImageRef::canonical("registry.local", "backend", commit, Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("registry.local/backend:0123456789ab-"));
    }

    #[test]
    fn test_attempt_ref_extends_canonical() {
        let run_id = Uuid::new_v4();
        let canonical = ImageRef::canonical("r", "backend", "abc1234", run_id);
        let attempt =
            ImageRef::attempt("r", "backend", "abc1234", run_id, StageName::BuildBackend, 2);
        assert!(attempt.as_str().starts_with(canonical.as_str()));
        assert!(attempt.as_str().ends_with("-build-backend-a2"));
    }

    #[test]
    fn test_severity_ordering_and_parsing() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
        assert!("bogus".parse::<Severity>().is_err());
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"HIGH\"");
    }

    #[test]
    fn test_mapping_and_promotion() {
        let mut target = target();
        let built: BTreeMap<_, _> = [
            (Component::Backend, ImageRef::new("r/backend:new")),
            (Component::Frontend, ImageRef::new("r/frontend:new")),
        ]
        .into_iter()
        .collect();

        let mapping = target.mapping_for(&built);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["api"], ImageRef::new("r/backend:new"));
        assert!(!mapping.contains_key("db"));

        target.current.insert("api".to_string(), ImageRef::new("r/backend:old"));
        let restorable = target.restorable(&mapping);
        assert_eq!(restorable.len(), 1);
        assert_eq!(target.unrestorable(&mapping), vec!["web".to_string()]);

        let previous = target.promote(&mapping);
        assert_eq!(previous["api"], ImageRef::new("r/backend:old"));
        assert_eq!(target.current["web"], ImageRef::new("r/frontend:new"));
    }
}

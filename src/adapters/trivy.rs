//! Trivy vulnerability scanner adapter.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{run_captured, tail, CollaboratorError, ImageScanner};
use crate::domain::{Finding, ImageRef, Severity};

/// Scanner using `trivy image --format json`
pub struct TrivyScanner {
    binary_path: String,
}

impl Default for TrivyScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TrivyScanner {
    pub fn new() -> Self {
        Self {
            binary_path: "trivy".to_string(),
        }
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,

    #[serde(rename = "Severity")]
    severity: String,
}

/// Parse a trivy JSON report into findings, most severe first
fn parse_report(json: &str) -> Result<Vec<Finding>, serde_json::Error> {
    let report: TrivyReport = serde_json::from_str(json)?;

    let mut findings: Vec<Finding> = report
        .results
        .into_iter()
        .flat_map(|r| r.vulnerabilities.unwrap_or_default())
        .map(|v| Finding {
            severity: v.severity.parse().unwrap_or(Severity::Unknown),
            id: v.id,
        })
        .collect();

    findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
    findings.dedup();
    Ok(findings)
}

#[async_trait]
impl ImageScanner for TrivyScanner {
    fn name(&self) -> &str {
        "trivy"
    }

    async fn scan(&self, image: &ImageRef) -> Result<Vec<Finding>, CollaboratorError> {
        let output = run_captured(
            Command::new(&self.binary_path).args([
                "image",
                "--quiet",
                "--format",
                "json",
                "--scanners",
                "vuln",
                image.as_str(),
            ]),
            "trivy",
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::Rejected(format!(
                "trivy failed for {}: {}",
                image,
                tail(stderr.trim(), 2048)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_report(&stdout)
            .map_err(|e| CollaboratorError::Rejected(format!("unreadable trivy report: {}", e)))
    }
}

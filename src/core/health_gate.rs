//! Post-deploy health verification.
//!
//! The gate polls every service of the target at a fixed interval and
//! combines their health into one composite status:
//! - every service `Up`: the target is healthy
//! - any service `Down`: a definitive failure; enough of these in a row
//!   end verification early
//! - otherwise (`Degraded`): not yet healthy, keep waiting

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::pipeline::HealthSettings;
use crate::adapters::{ContainerRuntime, ServiceHealth};
use crate::domain::DeploymentTarget;

/// Result of a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    Unhealthy,
    TimedOut,
}

/// Verdict plus the evidence it was reached on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub verdict: Verdict,

    /// Number of completed polls
    pub polls: u32,

    /// Per-service health from the last completed poll
    pub services: BTreeMap<String, ServiceHealth>,
}

/// Polls a deployment target until it is healthy, unhealthy, or out of time
pub struct HealthGate {
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    failure_threshold: u32,
}

impl HealthGate {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: &HealthSettings) -> Self {
        Self {
            runtime,
            interval: settings.interval(),
            failure_threshold: settings.failure_threshold.max(1),
        }
    }

    /// Poll `target` until a verdict is reached or `deadline` elapses
    pub async fn verify(&self, target: &DeploymentTarget, deadline: Duration) -> HealthReport {
        let deadline_at = Instant::now() + deadline;
        let mut polls = 0u32;
        let mut consecutive_down = 0u32;
        let mut services = BTreeMap::new();

        loop {
            if polls > 0 && Instant::now() >= deadline_at {
                return report(Verdict::TimedOut, polls, services);
            }

            match tokio::time::timeout_at(deadline_at, self.poll(target)).await {
                Ok(observed) => services = observed,
                Err(_) => return report(Verdict::TimedOut, polls, services),
            }
            polls += 1;

            match composite(&services) {
                ServiceHealth::Up => return report(Verdict::Healthy, polls, services),
                ServiceHealth::Down => {
                    consecutive_down += 1;
                    if consecutive_down >= self.failure_threshold {
                        return report(Verdict::Unhealthy, polls, services);
                    }
                }
                // Dependency warm-up: not a failure
                ServiceHealth::Degraded => consecutive_down = 0,
            }

            debug!(
                deployment = %target.name,
                polls,
                consecutive_down,
                "Target not yet healthy"
            );

            let next = (Instant::now() + self.interval).min(deadline_at);
            tokio::time::sleep_until(next).await;
        }
    }

    async fn poll(&self, target: &DeploymentTarget) -> BTreeMap<String, ServiceHealth> {
        let mut services = BTreeMap::new();
        for service in &target.services {
            let health = self.runtime.health_of(service).await;
            services.insert(service.name.clone(), health);
        }
        services
    }
}

fn report(
    verdict: Verdict,
    polls: u32,
    services: BTreeMap<String, ServiceHealth>,
) -> HealthReport {
    HealthReport {
        verdict,
        polls,
        services,
    }
}

/// Combine per-service health into the target's status
pub fn composite(services: &BTreeMap<String, ServiceHealth>) -> ServiceHealth {
    if services.values().any(|h| *h == ServiceHealth::Down) {
        ServiceHealth::Down
    } else if services.values().any(|h| *h == ServiceHealth::Degraded) {
        ServiceHealth::Degraded
    } else {
        ServiceHealth::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_status() {
        let mut services = BTreeMap::new();
        assert_eq!(composite(&services), ServiceHealth::Up);

        services.insert("api".to_string(), ServiceHealth::Up);
        services.insert("web".to_string(), ServiceHealth::Up);
        assert_eq!(composite(&services), ServiceHealth::Up);

        services.insert("api".to_string(), ServiceHealth::Degraded);
        assert_eq!(composite(&services), ServiceHealth::Degraded);

        services.insert("web".to_string(), ServiceHealth::Down);
        assert_eq!(composite(&services), ServiceHealth::Down);
    }
}

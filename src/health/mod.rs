//! Component health monitoring and recovery
//!
//! - Monitor: polls every registered component and aggregates an overall status
//! - Recovery: throttled, capped recovery attempts per component
//! - Checks: built-in memory, CPU and worker-pool probes

pub mod checks;
pub mod monitor;
pub mod recovery;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use checks::{CpuHealthCheck, MemoryHealthCheck, WorkerPoolCheck};
pub use monitor::{ComponentHealthMonitor, MonitorHandle};
pub use recovery::{RecoveryAttempt, RecoveryCoordinator, RecoveryDecision, RecoveryState};

/// Default upper bound for a component's own recovery action
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    /// Not checked yet
    Unknown,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, HealthStatus::Critical)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Overall status: critical if any critical, degraded if any other non-healthy
pub fn aggregate<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = HealthStatus>,
{
    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        match status {
            HealthStatus::Critical => return HealthStatus::Critical,
            HealthStatus::Healthy => {}
            HealthStatus::Degraded | HealthStatus::Unknown => overall = HealthStatus::Degraded,
        }
    }
    overall
}

/// Result of a single `check()`
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl HealthReport {
    pub fn new(status: HealthStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            metrics: BTreeMap::new(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, Some(message.into()))
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Critical, Some(message.into()))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// Anything the monitor can probe and ask to recover
///
/// `check()` errors and panics are caught by the monitor and reported as
/// `critical`; they never stop the monitoring loop.
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// Stable identifier, unique within one monitor
    fn component_id(&self) -> &str;

    /// Probe the component
    async fn check(&self) -> Result<HealthReport>;

    /// Try to restore the component; `Ok(true)` means recovered
    async fn attempt_recovery(&self) -> Result<bool> {
        Ok(false)
    }

    /// Upper bound for one `attempt_recovery()` call
    fn recovery_timeout(&self) -> Duration {
        DEFAULT_RECOVERY_TIMEOUT
    }
}

/// Health of one component as tracked by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentHealth {
    pub component_id: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub metrics: BTreeMap<String, f64>,
}

impl ComponentHealth {
    pub fn new(component_id: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            status: HealthStatus::Unknown,
            message: None,
            last_checked_at: None,
            consecutive_failures: 0,
            metrics: BTreeMap::new(),
        }
    }

    /// Record the outcome of a check
    pub fn apply(&mut self, report: HealthReport, checked_at: DateTime<Utc>) {
        if report.status.is_healthy() {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.status = report.status;
        self.message = report.message;
        self.metrics = report.metrics;
        self.last_checked_at = Some(checked_at);
    }
}

/// Aggregated health recomputed every monitor cycle
#[derive(Debug, Clone, PartialEq)]
pub struct OverallHealth {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for OverallHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            components: BTreeMap::new(),
            consecutive_failures: 0,
            last_check: None,
        }
    }
}

impl OverallHealth {
    /// Recompute the overall status from the component table
    pub fn recompute(&mut self, checked_at: DateTime<Utc>) {
        self.status = aggregate(self.components.values().map(|c| c.status));
        if self.status.is_healthy() {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.last_check = Some(checked_at);
    }

    /// Components that should be handed to recovery
    pub fn unhealthy_components(&self) -> impl Iterator<Item = &ComponentHealth> {
        self.components
            .values()
            .filter(|c| c.status != HealthStatus::Healthy)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            overall: self.status,
            components: self
                .components
                .iter()
                .map(|(id, c)| {
                    (
                        id.clone(),
                        ComponentSnapshot {
                            status: c.status,
                            message: c.message.clone(),
                            metrics: c.metrics.clone(),
                        },
                    )
                })
                .collect(),
            consecutive_failures: self.consecutive_failures,
            last_check: self.last_check,
        }
    }
}

/// Immutable health view for external readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub overall: HealthStatus,
    pub components: BTreeMap<String, ComponentSnapshot>,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        OverallHealth::default().snapshot()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [HealthStatus; 4] = [
        HealthStatus::Healthy,
        HealthStatus::Degraded,
        HealthStatus::Critical,
        HealthStatus::Unknown,
    ];

    #[test]
    fn test_aggregate_every_combination_of_three() {
        for a in ALL {
            for b in ALL {
                for c in ALL {
                    let statuses = [a, b, c];
                    let overall = aggregate(statuses);
                    let any_critical = statuses.iter().any(|s| s.is_critical());
                    let any_unhealthy = statuses.iter().any(|s| !s.is_healthy());

                    if any_critical {
                        assert_eq!(overall, HealthStatus::Critical, "{statuses:?}");
                    } else if any_unhealthy {
                        assert_eq!(overall, HealthStatus::Degraded, "{statuses:?}");
                    } else {
                        assert_eq!(overall, HealthStatus::Healthy, "{statuses:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_component_failure_counter() {
        let mut health = ComponentHealth::new("db");
        assert_eq!(health.status, HealthStatus::Unknown);

        health.apply(HealthReport::critical("down"), Utc::now());
        health.apply(HealthReport::degraded("slow"), Utc::now());
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.message.as_deref(), Some("slow"));

        health.apply(HealthReport::healthy(), Utc::now());
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.message.is_none());
    }

    #[test]
    fn test_snapshot_shape() {
        let mut overall = OverallHealth::default();
        let mut memory = ComponentHealth::new("memory");
        memory.apply(
            HealthReport::critical("90% used").with_metric("usedFraction", 0.9),
            Utc::now(),
        );
        overall.components.insert("memory".to_string(), memory);
        overall.recompute(Utc::now());

        let json = serde_json::to_value(overall.snapshot()).unwrap();
        assert_eq!(json["overall"], "critical");
        assert_eq!(json["consecutiveFailures"], 1);
        assert_eq!(json["components"]["memory"]["status"], "critical");
        assert_eq!(json["components"]["memory"]["message"], "90% used");
        assert_eq!(json["components"]["memory"]["metrics"]["usedFraction"], 0.9);
        assert!(json["lastCheck"].is_string());
    }

    #[test]
    fn test_unknown_components_are_handed_to_recovery() {
        let mut overall = OverallHealth::default();
        for (id, report) in [
            ("db", HealthReport::healthy()),
            ("cache", HealthReport::degraded("slow")),
            ("legacy", HealthReport::new(HealthStatus::Unknown, None)),
        ] {
            let mut component = ComponentHealth::new(id);
            component.apply(report, Utc::now());
            overall.components.insert(id.to_string(), component);
        }
        overall.recompute(Utc::now());

        let ids: Vec<&str> = overall
            .unhealthy_components()
            .map(|c| c.component_id.as_str())
            .collect();
        assert_eq!(ids, vec!["cache", "legacy"]);
    }
}

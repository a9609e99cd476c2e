//! Built-in health checks
//!
//! Memory and CPU readings come from `sysinfo` behind small source traits so
//! the classification logic can be exercised with fixed readings.

use super::{HealthCheckable, HealthReport, HealthStatus};
use crate::error::{Result, SupervisorError};
use crate::supervisor::SupervisorHandle;
use async_trait::async_trait;
use std::sync::Mutex;
use sysinfo::{MemoryRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// Degraded starts at this fraction of the critical threshold
const DEGRADED_RATIO: f64 = 0.8;

/// Classify a reading against a critical threshold
pub fn classify(value: f64, critical_threshold: f64) -> HealthStatus {
    if value > critical_threshold {
        HealthStatus::Critical
    } else if value > critical_threshold * DEGRADED_RATIO {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Resident memory of the current process in bytes (0 if unavailable)
pub fn current_process_memory() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadReading {
    /// 1-minute load average
    pub load_one: f64,
    pub cores: usize,
}

pub trait MemorySource: Send + Sync {
    fn read(&self) -> Result<MemoryReading>;
}

pub trait LoadSource: Send + Sync {
    fn read(&self) -> Result<LoadReading>;
}

/// Process memory against total system memory
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SystemMemory {
    fn read(&self) -> Result<MemoryReading> {
        let pid = sysinfo::get_current_pid().map_err(|e| SupervisorError::ComponentCheck {
            component: "memory".to_string(),
            reason: e.to_string(),
        })?;
        let mut system = self.system.lock().map_err(|_| SupervisorError::ComponentCheck {
            component: "memory".to_string(),
            reason: "sysinfo state poisoned".to_string(),
        })?;
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        Ok(MemoryReading {
            used_bytes: system.process(pid).map(|p| p.memory()).unwrap_or(0),
            total_bytes: system.total_memory(),
        })
    }
}

/// Host load average and core count
pub struct SystemLoad {
    cores: usize,
}

impl SystemLoad {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(sysinfo::CpuRefreshKind::everything()),
        );
        Self {
            cores: system.cpus().len().max(1),
        }
    }
}

impl Default for SystemLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSource for SystemLoad {
    fn read(&self) -> Result<LoadReading> {
        Ok(LoadReading {
            load_one: System::load_average().one,
            cores: self.cores,
        })
    }
}

/// Memory pressure of this process
pub struct MemoryHealthCheck {
    critical_threshold: f64,
    source: Box<dyn MemorySource>,
}

impl MemoryHealthCheck {
    pub fn new(critical_threshold: f64) -> Self {
        Self::with_source(critical_threshold, Box::new(SystemMemory::new()))
    }

    pub fn with_source(critical_threshold: f64, source: Box<dyn MemorySource>) -> Self {
        Self {
            critical_threshold,
            source,
        }
    }
}

#[async_trait]
impl HealthCheckable for MemoryHealthCheck {
    fn component_id(&self) -> &str {
        "memory"
    }

    async fn check(&self) -> Result<HealthReport> {
        let reading = self.source.read()?;
        if reading.total_bytes == 0 {
            return Err(SupervisorError::ComponentCheck {
                component: "memory".to_string(),
                reason: "total system memory reported as zero".to_string(),
            });
        }

        let used_fraction = reading.used_bytes as f64 / reading.total_bytes as f64;
        let status = classify(used_fraction, self.critical_threshold);
        let message = format!(
            "{:.1}% of system memory used (critical above {:.1}%)",
            used_fraction * 100.0,
            self.critical_threshold * 100.0
        );

        Ok(HealthReport::new(status, Some(message))
            .with_metric("usedBytes", reading.used_bytes as f64)
            .with_metric("totalBytes", reading.total_bytes as f64)
            .with_metric("usedFraction", used_fraction))
    }
}

/// Host CPU load per core
pub struct CpuHealthCheck {
    critical_threshold: f64,
    source: Box<dyn LoadSource>,
}

impl CpuHealthCheck {
    pub fn new(critical_threshold: f64) -> Self {
        Self::with_source(critical_threshold, Box::new(SystemLoad::new()))
    }

    pub fn with_source(critical_threshold: f64, source: Box<dyn LoadSource>) -> Self {
        Self {
            critical_threshold,
            source,
        }
    }
}

#[async_trait]
impl HealthCheckable for CpuHealthCheck {
    fn component_id(&self) -> &str {
        "cpu"
    }

    async fn check(&self) -> Result<HealthReport> {
        let reading = self.source.read()?;
        let load_per_core = reading.load_one / reading.cores.max(1) as f64;
        let status = classify(load_per_core, self.critical_threshold);

        Ok(HealthReport::new(
            status,
            Some(format!(
                "1m load {:.2} over {} cores",
                reading.load_one, reading.cores
            )),
        )
        .with_metric("loadOne", reading.load_one)
        .with_metric("cores", reading.cores as f64)
        .with_metric("loadPerCore", load_per_core))
    }
}

/// Worker pool staffing as seen by the supervisor
pub struct WorkerPoolCheck {
    supervisor: SupervisorHandle,
}

impl WorkerPoolCheck {
    pub fn new(supervisor: SupervisorHandle) -> Self {
        Self { supervisor }
    }

    fn report(&self) -> HealthReport {
        let snapshot = self.supervisor.snapshot();
        let online = snapshot.online_count();
        let desired = snapshot.desired_workers;

        let report = if snapshot.shutting_down {
            HealthReport::degraded("worker pool shutting down")
        } else if online == 0 {
            HealthReport::critical(format!("no workers online (desired {desired})"))
        } else if online < desired {
            HealthReport::degraded(format!("{online}/{desired} workers online"))
        } else {
            HealthReport::healthy().with_message(format!("{online}/{desired} workers online"))
        };

        report
            .with_metric("online", online as f64)
            .with_metric("desired", desired as f64)
            .with_metric("total", snapshot.workers.len() as f64)
    }
}

#[async_trait]
impl HealthCheckable for WorkerPoolCheck {
    fn component_id(&self) -> &str {
        "worker_pool"
    }

    async fn check(&self) -> Result<HealthReport> {
        Ok(self.report())
    }

    /// The supervisor replaces workers on its own; recovery only confirms it caught up
    async fn attempt_recovery(&self) -> Result<bool> {
        Ok(self.report().status.is_healthy())
    }
}

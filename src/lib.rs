pub mod bootstrap;
pub mod channel;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod supervisor;

pub use bootstrap::{Supervision, SupervisionBuilder};
pub use channel::{
    SupervisorMessage, WorkerCounters, WorkerEndpoint, WorkerMessage, WorkerMetrics, WorkerRuntime,
};
pub use config::AppConfig;
pub use coordination::{
    ShutdownOrchestrator, ShutdownOutcome, ShutdownPhase, ShutdownResource, ShutdownSignal,
    ShutdownToken,
};
pub use error::{Result, SupervisorError};
pub use events::{EventSink, SupervisionEvent};
pub use health::{
    ComponentHealthMonitor, HealthCheckable, HealthReport, HealthSnapshot, HealthStatus,
    MonitorHandle, RecoveryCoordinator, RecoveryState,
};
pub use supervisor::{
    PoolSnapshot, ProcessLauncher, SupervisorHandle, TaskLauncher, WorkerLauncher,
    WorkerSupervisor,
};

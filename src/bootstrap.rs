//! Process wiring
//!
//! Builds the supervisor, health monitor and shutdown orchestrator from one
//! [`AppConfig`] and passes each its collaborators explicitly.

use crate::channel::{bridge, WorkerCounters, WorkerEndpoint, WorkerRuntime, WorkerRuntimeConfig};
use crate::config::{AppConfig, WorkerConfig};
use crate::coordination::{
    install_signal_handlers, spawn_exit_backstop, ShutdownOrchestrator, ShutdownOutcome,
};
use crate::error::{Result, SupervisorError};
use crate::events::{log_events, EventSink};
use crate::health::{
    ComponentHealthMonitor, CpuHealthCheck, HealthCheckable, MemoryHealthCheck, MonitorHandle,
    RecoveryCoordinator, WorkerPoolCheck,
};
use crate::supervisor::{ProcessLauncher, SupervisorHandle, WorkerLauncher, WorkerSupervisor};
use std::sync::Arc;
use tracing::{info, warn};

/// Channel buffer between a worker process and its stdio bridge
const WORKER_CHANNEL_CAPACITY: usize = 32;

/// A running supervision stack
pub struct Supervision {
    pub events: EventSink,
    pub supervisor: SupervisorHandle,
    pub monitor: Arc<MonitorHandle>,
    pub orchestrator: Arc<ShutdownOrchestrator>,
}

impl Supervision {
    /// Block until SIGTERM/SIGINT (or a programmatic request), then shut down
    ///
    /// The exit backstop is armed as soon as the request arrives.
    pub async fn run_until_shutdown(&self) -> ShutdownOutcome {
        let signal = self.orchestrator.wait_for_request().await;
        let limit = self.orchestrator.hard_limit();
        if let Err(e) = spawn_exit_backstop(limit) {
            warn!(error = %e, "Could not arm the shutdown backstop");
        }
        info!(%signal, "Stopping supervision");
        self.orchestrator.shutdown().await
    }
}

/// Assembles a [`Supervision`]
pub struct SupervisionBuilder {
    config: AppConfig,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    components: Vec<Arc<dyn HealthCheckable>>,
    builtin_checks: bool,
    events: EventSink,
    orchestrator: Option<Arc<ShutdownOrchestrator>>,
}

impl SupervisionBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            launcher: None,
            components: Vec::new(),
            builtin_checks: true,
            events: EventSink::default(),
            orchestrator: None,
        }
    }

    /// Use a specific launcher instead of the configured worker program
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Register an extra health-checked component
    pub fn component(mut self, component: Arc<dyn HealthCheckable>) -> Self {
        self.components.push(component);
        self
    }

    /// Skip the memory and CPU host checks
    pub fn without_builtin_checks(mut self) -> Self {
        self.builtin_checks = false;
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Use an orchestrator created ahead of time, e.g. one already wired to signals
    pub fn orchestrator(mut self, orchestrator: Arc<ShutdownOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    fn default_launcher(worker: &WorkerConfig) -> Result<Arc<dyn WorkerLauncher>> {
        let launcher = match &worker.program {
            Some(program) => ProcessLauncher::new(program, worker.args.clone()),
            None => ProcessLauncher::current_exe()?,
        };
        Ok(Arc::new(launcher))
    }

    /// Validate the configuration and start everything
    pub async fn start(self) -> Result<Supervision> {
        let config = self.config;
        config.validate().map_err(SupervisorError::InvalidConfig)?;

        let events = self.events;
        tokio::spawn(log_events(events.subscribe()));

        let launcher = match self.launcher {
            Some(launcher) => launcher,
            None => Self::default_launcher(&config.worker)?,
        };
        let supervisor =
            WorkerSupervisor::start(config.pool.clone(), launcher, events.clone()).await?;

        let recovery = RecoveryCoordinator::new(&config.recovery, events.clone());
        let mut monitor = ComponentHealthMonitor::new(config.health.clone(), recovery, events.clone());
        if self.builtin_checks {
            monitor.register(Arc::new(MemoryHealthCheck::new(
                config.health.memory_critical_threshold,
            )))?;
            monitor.register(Arc::new(CpuHealthCheck::new(
                config.health.cpu_critical_threshold,
            )))?;
        }
        monitor.register(Arc::new(WorkerPoolCheck::new(supervisor.clone())))?;
        for component in self.components {
            monitor.register(component)?;
        }
        let monitor = Arc::new(monitor.spawn());

        let orchestrator = match self.orchestrator {
            Some(orchestrator) => orchestrator,
            None => Arc::new(ShutdownOrchestrator::new(
                config.shutdown.clone(),
                events.clone(),
            )),
        };
        orchestrator.register(Arc::new(supervisor.clone())).await;
        orchestrator.register(monitor.clone()).await;

        info!(
            workers = config.pool.desired_workers,
            deadline_ms = config.shutdown.deadline_ms,
            "Supervision started"
        );

        Ok(Supervision {
            events,
            supervisor,
            monitor,
            orchestrator,
        })
    }
}

/// `dexsup run`: supervise until a signal arrives; returns the exit code
///
/// Signal handlers go in before any worker is launched; a signal that lands
/// during startup is latched and honored once startup finishes.
pub async fn run_supervisor(config: AppConfig) -> Result<i32> {
    let events = EventSink::default();
    let orchestrator = Arc::new(ShutdownOrchestrator::new(
        config.shutdown.clone(),
        events.clone(),
    ));
    install_signal_handlers(orchestrator.clone())?;

    let supervision = SupervisionBuilder::new(config)
        .events(events)
        .orchestrator(orchestrator)
        .start()
        .await?;
    let outcome = supervision.run_until_shutdown().await;
    Ok(outcome.exit_code())
}

/// `dexsup worker`: serve the health channel on stdin/stdout
pub async fn run_worker(config: &WorkerConfig) -> i32 {
    let endpoint: WorkerEndpoint = bridge(
        tokio::io::stdin(),
        tokio::io::stdout(),
        WORKER_CHANNEL_CAPACITY,
    );
    let runtime = WorkerRuntime::new(
        WorkerRuntimeConfig {
            metrics_interval: config.metrics_interval(),
            drain_timeout: config.drain_timeout(),
        },
        WorkerCounters::new(),
    );
    info!(
        id = std::env::var(crate::supervisor::launcher::WORKER_ID_ENV).unwrap_or_default(),
        "Worker starting"
    );
    runtime.run_until(endpoint, termination()).await
}

/// Resolves on SIGTERM or SIGINT
async fn termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! Shutdown Orchestrator
//!
//! Deadline-bounded termination of every registered resource. The first
//! SIGTERM/SIGINT (or programmatic request) moves the process from `Running`
//! to `ShuttingDown`; all resources then close concurrently while an
//! independent timer races them. The process ends `Stopped` when everything
//! closed in time, `ForcedStop` otherwise.

use crate::config::ShutdownConfig;
use crate::error::Result;
use crate::events::{EventSink, SupervisionEvent};
use crate::health::MonitorHandle;
use crate::supervisor::SupervisorHandle;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What triggered the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// Programmatic request
    Requested,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Requested => write!(f, "requested"),
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Running,
    ShuttingDown,
    /// Every resource closed before the deadline
    Stopped,
    /// Deadline exceeded
    ForcedStop,
}

impl ShutdownPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShutdownPhase::Stopped | ShutdownPhase::ForcedStop)
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::ShuttingDown => write!(f, "shutting_down"),
            ShutdownPhase::Stopped => write!(f, "stopped"),
            ShutdownPhase::ForcedStop => write!(f, "forced_stop"),
        }
    }
}

/// Anything that must be closed before the process exits
#[async_trait]
pub trait ShutdownResource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Close the resource; `deadline` is the time left for the whole shutdown
    async fn close(&self, deadline: Duration) -> Result<()>;
}

#[async_trait]
impl ShutdownResource for SupervisorHandle {
    fn name(&self) -> &str {
        "worker_pool"
    }

    async fn close(&self, deadline: Duration) -> Result<()> {
        self.shutdown(deadline).await
    }
}

#[async_trait]
impl ShutdownResource for MonitorHandle {
    fn name(&self) -> &str {
        "health_monitor"
    }

    async fn close(&self, _deadline: Duration) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}

/// How one resource ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Closed,
    Failed(String),
    /// Still closing when the deadline hit
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub name: String,
    pub state: ResourceState,
    pub elapsed: Duration,
}

/// Result of a completed shutdown sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub phase: ShutdownPhase,
    pub resources: Vec<ResourceOutcome>,
    pub elapsed: Duration,
}

impl ShutdownOutcome {
    /// Every resource closed cleanly before the deadline
    pub fn is_clean(&self) -> bool {
        self.phase == ShutdownPhase::Stopped
            && self.resources.iter().all(|r| r.state == ResourceState::Closed)
    }

    /// Process exit code: 0 clean, 1 forced or failed
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

/// Coordinates process-wide shutdown
pub struct ShutdownOrchestrator {
    config: ShutdownConfig,
    events: EventSink,
    shutdown_requested: AtomicBool,
    request_tx: watch::Sender<Option<ShutdownSignal>>,
    phase_tx: watch::Sender<ShutdownPhase>,
    resources: RwLock<Vec<Arc<dyn ShutdownResource>>>,
    outcome: OnceCell<ShutdownOutcome>,
}

impl ShutdownOrchestrator {
    pub fn new(config: ShutdownConfig, events: EventSink) -> Self {
        let (request_tx, _) = watch::channel(None);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            events,
            shutdown_requested: AtomicBool::new(false),
            request_tx,
            phase_tx,
            resources: RwLock::new(Vec::new()),
            outcome: OnceCell::new(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default(), EventSink::default())
    }

    /// Resources are closed concurrently; registration order does not matter
    pub async fn register(&self, resource: Arc<dyn ShutdownResource>) {
        debug!(resource = resource.name(), "Registered shutdown resource");
        self.resources.write().await.push(resource);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            request_rx: self.request_tx.subscribe(),
            phase_rx: self.phase_tx.subscribe(),
        }
    }

    /// Move to `ShuttingDown`; returns false for repeated requests
    pub fn request_shutdown(&self, signal: ShutdownSignal) -> bool {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!(%signal, "Shutdown already requested, ignoring");
            return false;
        }

        info!(%signal, deadline_ms = self.config.deadline_ms, "Shutdown requested");
        self.set_phase(ShutdownPhase::ShuttingDown);
        self.request_tx.send_replace(Some(signal));
        true
    }

    /// Wait for the first shutdown request
    pub async fn wait_for_request(&self) -> ShutdownSignal {
        let mut rx = self.request_tx.subscribe();
        let signal = match rx.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Requested),
            Err(_) => ShutdownSignal::Requested,
        };
        signal
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!(%phase, "Shutdown phase");
    }

    /// Run the shutdown sequence once; later calls return the same outcome
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.request_shutdown(ShutdownSignal::Requested);
        self.outcome.get_or_init(|| self.execute()).await.clone()
    }

    async fn execute(&self) -> ShutdownOutcome {
        let started = Instant::now();
        let deadline = self.config.deadline();
        let deadline_at = started + deadline;
        let signal = (*self.request_tx.borrow()).unwrap_or(ShutdownSignal::Requested);

        let resources = self.resources.read().await.clone();
        info!(
            resources = resources.len(),
            deadline_ms = deadline.as_millis() as u64,
            "Starting graceful shutdown"
        );
        self.events.emit(SupervisionEvent::ShutdownStarted {
            signal: signal.to_string(),
            deadline_ms: deadline.as_millis() as u64,
        });

        let mut outcomes: Vec<ResourceOutcome> = resources
            .iter()
            .map(|r| ResourceOutcome {
                name: r.name().to_string(),
                state: ResourceState::Open,
                elapsed: deadline,
            })
            .collect();

        let mut closing = JoinSet::new();
        for (index, resource) in resources.into_iter().enumerate() {
            closing.spawn(async move {
                let close = AssertUnwindSafe(resource.close(deadline)).catch_unwind();
                let state = match close.await {
                    Ok(Ok(())) => ResourceState::Closed,
                    Ok(Err(e)) => ResourceState::Failed(e.to_string()),
                    Err(_) => ResourceState::Failed("close panicked".to_string()),
                };
                (index, state, started.elapsed())
            });
        }

        let timer = tokio::time::sleep_until(deadline_at);
        tokio::pin!(timer);

        let mut forced = false;
        while !closing.is_empty() {
            tokio::select! {
                biased;
                Some(joined) = closing.join_next() => {
                    let Ok((index, state, elapsed)) = joined else {
                        continue;
                    };
                    self.record(&mut outcomes[index], state, elapsed);
                }
                _ = &mut timer => {
                    forced = true;
                    break;
                }
            }
        }
        // Never wait on a resource past the deadline
        closing.abort_all();

        for outcome in outcomes.iter().filter(|o| o.state == ResourceState::Open) {
            error!(resource = %outcome.name, "Resource still open at shutdown deadline");
        }

        let phase = if forced {
            ShutdownPhase::ForcedStop
        } else {
            ShutdownPhase::Stopped
        };
        let outcome = ShutdownOutcome {
            phase,
            resources: outcomes,
            elapsed: started.elapsed(),
        };

        if forced {
            warn!(
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "Shutdown deadline exceeded, forcing exit"
            );
        } else if outcome.is_clean() {
            info!(elapsed_ms = outcome.elapsed.as_millis() as u64, "Graceful shutdown completed");
        } else {
            warn!(
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "Shutdown completed with resource errors"
            );
        }

        self.set_phase(phase);
        self.events.emit(SupervisionEvent::ShutdownFinished {
            phase: phase.to_string(),
            exit_code: outcome.exit_code(),
            elapsed_ms: outcome.elapsed.as_millis() as u64,
        });
        outcome
    }

    fn record(&self, outcome: &mut ResourceOutcome, state: ResourceState, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match &state {
            ResourceState::Closed => info!(resource = %outcome.name, elapsed_ms, "Resource closed"),
            ResourceState::Failed(e) => {
                warn!(resource = %outcome.name, elapsed_ms, error = %e, "Resource failed to close")
            }
            ResourceState::Open => {}
        }

        self.events.emit(SupervisionEvent::ResourceClosed {
            resource: outcome.name.clone(),
            ok: state == ResourceState::Closed,
            error: match &state {
                ResourceState::Failed(e) => Some(e.clone()),
                _ => None,
            },
            elapsed_ms,
        });
        outcome.state = state;
        outcome.elapsed = elapsed;
    }

    /// Wait for a signal, then shut down
    pub async fn run_until_signal(&self) -> ShutdownOutcome {
        let signal = self.wait_for_request().await;
        debug!(%signal, "Shutdown sequence starting");
        self.shutdown().await
    }

    /// Deadline plus backstop grace; the hard upper bound on process lifetime
    /// once shutdown begins
    pub fn hard_limit(&self) -> Duration {
        self.config.deadline() + self.config.backstop_grace()
    }
}

/// Token for observing shutdown from async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    request_rx: watch::Receiver<Option<ShutdownSignal>>,
    phase_rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.request_rx.borrow().is_some()
    }

    /// Wait for the shutdown request
    pub async fn cancelled(&mut self) -> ShutdownSignal {
        match self.request_rx.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Requested),
            // Orchestrator gone counts as a request
            Err(_) => ShutdownSignal::Requested,
        }
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    pub async fn wait_for_phase(&mut self, target: ShutdownPhase) {
        let _ = self.phase_rx.wait_for(|phase| *phase == target).await;
    }
}

/// Install SIGTERM and SIGINT handlers that request shutdown
pub fn install_signal_handlers(orchestrator: Arc<ShutdownOrchestrator>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = sigterm.recv() => ShutdownSignal::Terminate,
                    Some(()) = sigint.recv() => ShutdownSignal::Interrupt,
                    else => break,
                };
                info!(signal = %received, "Received signal");
                orchestrator.request_shutdown(received);
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                orchestrator.request_shutdown(ShutdownSignal::Interrupt);
            }
        });
    }

    Ok(())
}

/// Exit the process with code 1 after `after`, even if the runtime is wedged
///
/// Runs on a plain OS thread so it fires without the async executor.
pub fn spawn_exit_backstop(after: Duration) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("shutdown-backstop".to_string())
        .spawn(move || {
            std::thread::sleep(after);
            error!(after_ms = after.as_millis() as u64, "Shutdown backstop fired, exiting");
            std::process::exit(1);
        })
}

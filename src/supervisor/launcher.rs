//! Worker launchers
//!
//! A launcher is the fork/terminate capability the pool is built on. It hands
//! back the supervisor side of the worker's channel, a one-shot exit
//! observer and a one-shot kill switch.

use crate::channel::{
    bridge, pair, SupervisorEndpoint, WorkerCounters, WorkerEndpoint, WorkerRuntime,
    WorkerRuntimeConfig,
};
use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Environment variable carrying the worker id into a child process
pub const WORKER_ID_ENV: &str = "DEXSUP_WORKER_ID";
/// Environment variable carrying the pool slot into a child process
pub const WORKER_SLOT_ENV: &str = "DEXSUP_WORKER_SLOT";

/// Signal number reported for workers stopped through their kill switch
const SIGKILL: i32 = 9;

/// What to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
    pub id: u64,
    pub slot: usize,
    pub channel_capacity: usize,
}

/// How a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit status could not be observed
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {}", signal_name(signal)),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Human-readable signal name
pub fn signal_name(signal: i32) -> String {
    #[cfg(unix)]
    {
        match nix::sys::signal::Signal::try_from(signal) {
            Ok(sig) => sig.as_str().to_string(),
            Err(_) => signal.to_string(),
        }
    }
    #[cfg(not(unix))]
    {
        signal.to_string()
    }
}

/// A running worker as handed to the pool
#[derive(Debug)]
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub endpoint: SupervisorEndpoint,
    /// Resolves once with the worker's exit
    pub exit: oneshot::Receiver<WorkerExit>,
    /// Send `()` to force-kill the worker
    pub kill: oneshot::Sender<()>,
}

/// Fork/terminate capability
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, spec: WorkerSpec) -> Result<LaunchedWorker>;
}

/// Launches workers as OS child processes speaking JSON lines over stdio
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the current binary with the `worker` subcommand
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["worker".to_string()]))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: WorkerSpec) -> Result<LaunchedWorker> {
        let launch_error = |reason: String| SupervisorError::Launch {
            slot: spec.slot,
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ID_ENV, spec.id.to_string())
            .env(WORKER_SLOT_ENV, spec.slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_error(format!("{}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("child stdout not captured".to_string()))?;

        let pid = child.id();
        let endpoint = bridge(stdout, stdin, spec.channel_capacity);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(id = spec.id, error = %e, "Failed to kill worker process");
                    }
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => WorkerExit::from_status(status),
                Err(e) => {
                    warn!(id = spec.id, error = %e, "Failed to observe worker exit");
                    WorkerExit::unknown()
                }
            };
            let _ = exit_tx.send(exit);
        });

        debug!(id = spec.id, slot = spec.slot, pid = ?pid, "Worker process spawned");
        Ok(LaunchedWorker {
            pid,
            endpoint,
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

type WorkerFactory = Arc<dyn Fn(WorkerSpec, WorkerEndpoint) -> BoxFuture<'static, i32> + Send + Sync>;

/// Launches workers as in-process tokio tasks
///
/// The factory's future is the worker body; its output is the exit code. A
/// kill aborts the task and reports SIGKILL, a panic reports exit code 1.
#[derive(Clone)]
pub struct TaskLauncher {
    factory: WorkerFactory,
}

impl TaskLauncher {
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(WorkerSpec, WorkerEndpoint) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        Self {
            factory: Arc::new(move |spec, endpoint| Box::pin(factory(spec, endpoint))),
        }
    }

    /// Every worker runs the stock protocol runtime with its own counters
    pub fn with_runtime(config: WorkerRuntimeConfig) -> Self {
        Self::new(move |_spec, endpoint| {
            WorkerRuntime::new(config.clone(), WorkerCounters::new()).run(endpoint)
        })
    }
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher").finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(&self, spec: WorkerSpec) -> Result<LaunchedWorker> {
        let (endpoint, worker_endpoint) = pair(spec.channel_capacity);
        let mut task = tokio::spawn((self.factory)(spec, worker_endpoint));
        let abort = task.abort_handle();

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let joined = tokio::select! {
                joined = &mut task => joined,
                Ok(()) = kill_rx => {
                    abort.abort();
                    task.await
                }
            };

            let exit = match joined {
                Ok(code) => WorkerExit::code(code),
                Err(e) if e.is_cancelled() => WorkerExit::signal(SIGKILL),
                Err(_) => WorkerExit::code(1),
            };
            let _ = exit_tx.send(exit);
        });

        Ok(LaunchedWorker {
            pid: None,
            endpoint,
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

//! Worker pool supervision
//!
//! - Pool: keeps the desired number of workers alive, restarts with backoff
//! - Launcher: the fork/terminate capability (OS processes or tokio tasks)

pub mod launcher;
pub mod pool;

pub use launcher::{
    signal_name, LaunchedWorker, ProcessLauncher, TaskLauncher, WorkerExit, WorkerLauncher,
    WorkerSpec,
};
pub use pool::{
    restart_delay, PoolSnapshot, SupervisorHandle, WorkerSnapshot, WorkerStatus, WorkerSupervisor,
};

//! Coordination layer for process lifetime
//!
//! - Shutdown orchestration under one global deadline
//! - OS signal handling and the exit backstop

pub mod shutdown;

pub use shutdown::{
    install_signal_handlers, spawn_exit_backstop, ResourceOutcome, ResourceState,
    ShutdownOrchestrator, ShutdownOutcome, ShutdownPhase, ShutdownResource, ShutdownSignal,
    ShutdownToken,
};

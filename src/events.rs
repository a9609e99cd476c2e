//! Supervision events
//!
//! Every subsystem publishes what it observes and decides onto one broadcast
//! sink. Listeners (the bootstrap logger, an external alerting bridge, tests)
//! subscribe independently; a slow listener only loses its own backlog.

use crate::health::{HealthSnapshot, HealthStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Event emitted by the supervision core
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisionEvent {
    /// Worker answered with `ready`
    WorkerOnline { id: u64, slot: usize, pid: Option<u32> },
    /// Worker process terminated
    WorkerExited {
        id: u64,
        slot: usize,
        code: Option<i32>,
        signal: Option<i32>,
        expected: bool,
    },
    /// Replacement fork scheduled for a slot
    WorkerRestartScheduled {
        slot: usize,
        delay_ms: u64,
        restart_count: u32,
    },
    /// Worker missed its liveness window and was force-killed
    WorkerUnresponsive { id: u64, slot: usize, silent_ms: u64 },
    /// Worker reported memory above the configured limit
    WorkerMemoryExceeded {
        id: u64,
        memory_bytes: u64,
        limit_bytes: u64,
    },
    /// One monitor cycle finished
    HealthCycle {
        snapshot: HealthSnapshot,
        duration_ms: u64,
    },
    /// Consecutive unhealthy cycles reached the configured threshold
    HealthThresholdExceeded {
        status: HealthStatus,
        consecutive_failures: u32,
    },
    /// Recovery attempt started for a component
    RecoveryAttempt { component: String, attempt: u32 },
    /// Component recovered
    RecoverySucceeded { component: String, attempts: u32 },
    /// Recovery attempt did not restore the component
    RecoveryFailed {
        component: String,
        attempt: u32,
        error: Option<String>,
    },
    /// Component exhausted its recovery attempts
    RecoveryExhausted { component: String, attempts: u32 },
    /// Shutdown requested
    ShutdownStarted { signal: String, deadline_ms: u64 },
    /// Resource finished closing
    ResourceClosed {
        resource: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u64,
    },
    /// Shutdown reached a terminal phase
    ShutdownFinished {
        phase: String,
        exit_code: i32,
        elapsed_ms: u64,
    },
}

impl SupervisionEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            SupervisionEvent::WorkerOnline { .. } => "worker_online",
            SupervisionEvent::WorkerExited { .. } => "worker_exited",
            SupervisionEvent::WorkerRestartScheduled { .. } => "worker_restart_scheduled",
            SupervisionEvent::WorkerUnresponsive { .. } => "worker_unresponsive",
            SupervisionEvent::WorkerMemoryExceeded { .. } => "worker_memory_exceeded",
            SupervisionEvent::HealthCycle { .. } => "health_cycle",
            SupervisionEvent::HealthThresholdExceeded { .. } => "health_threshold_exceeded",
            SupervisionEvent::RecoveryAttempt { .. } => "recovery_attempt",
            SupervisionEvent::RecoverySucceeded { .. } => "recovery_succeeded",
            SupervisionEvent::RecoveryFailed { .. } => "recovery_failed",
            SupervisionEvent::RecoveryExhausted { .. } => "recovery_exhausted",
            SupervisionEvent::ShutdownStarted { .. } => "shutdown_started",
            SupervisionEvent::ResourceClosed { .. } => "resource_closed",
            SupervisionEvent::ShutdownFinished { .. } => "shutdown_finished",
        }
    }

    /// Events meant for external alerting
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisionEvent::HealthThresholdExceeded { .. }
                | SupervisionEvent::RecoveryExhausted { .. }
        )
    }
}

/// Cloneable publishing side of the event stream
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SupervisionEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; having no listeners is fine
    pub fn emit(&self, event: SupervisionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Mirror every event into the log until the sink is dropped
pub async fn log_events(mut rx: broadcast::Receiver<SupervisionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SupervisionEvent::HealthCycle { .. }) => {
                // Cycle summaries are logged by the monitor itself
            }
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                if event.is_terminal() {
                    error!(event = event.name(), %payload, "Terminal supervision event");
                } else {
                    info!(event = event.name(), %payload, "Supervision event");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let sink = EventSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        sink.emit(SupervisionEvent::RecoveryExhausted {
            component: "database".to_string(),
            attempts: 3,
        });

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.name(), "recovery_exhausted");
            assert!(event.is_terminal());
        }
    }

    #[test]
    fn test_emit_without_listeners_is_silent() {
        let sink = EventSink::default();
        sink.emit(SupervisionEvent::WorkerOnline {
            id: 1,
            slot: 0,
            pid: None,
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = SupervisionEvent::WorkerRestartScheduled {
            slot: 1,
            delay_ms: 2000,
            restart_count: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "worker_restart_scheduled");
        assert_eq!(json["delay_ms"], 2000);
    }
}

//! Recovery Coordinator
//!
//! Governs when and how often a component's own recovery action runs.
//! Detection lives in the monitor; this only throttles, serializes and caps
//! attempts so a flapping component cannot start parallel recoveries and a
//! permanent outage is not hidden behind endless retries.
//!
//! ```text
//! Idle --(unhealthy)--> AttemptScheduled --(delay)--> Attempting
//! Attempting --(recovered)--> Idle (entry removed)
//! Attempting --(failed, attempts < max)--> Idle
//! Attempting --(failed, attempts == max)--> Failed (terminal)
//! Idle --(checked healthy)--> Idle (entry removed)
//! ```

use super::HealthCheckable;
use crate::config::RecoveryConfig;
use crate::events::{EventSink, SupervisionEvent};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Recovery state of a single component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    AttemptScheduled,
    Attempting,
    /// Attempts exhausted; never retried
    Failed,
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryState::Idle => write!(f, "idle"),
            RecoveryState::AttemptScheduled => write!(f, "attempt_scheduled"),
            RecoveryState::Attempting => write!(f, "attempting"),
            RecoveryState::Failed => write!(f, "failed"),
        }
    }
}

/// Bookkeeping for a component with recovery history
#[derive(Debug, Clone)]
pub struct RecoveryAttempt {
    pub component_id: String,
    /// Attempts started since the last success
    pub attempts: u32,
    pub in_progress: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the in-progress attempt starts running
    starts_at: Option<Instant>,
    failed: bool,
}

impl RecoveryAttempt {
    fn new(component_id: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            attempts: 0,
            in_progress: false,
            last_attempt_at: None,
            starts_at: None,
            failed: false,
        }
    }

    pub fn state(&self) -> RecoveryState {
        if self.failed {
            RecoveryState::Failed
        } else if !self.in_progress {
            RecoveryState::Idle
        } else if self.starts_at.is_some_and(|at| Instant::now() < at) {
            RecoveryState::AttemptScheduled
        } else {
            RecoveryState::Attempting
        }
    }
}

/// What `recover_component` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// A new attempt was scheduled
    Scheduled { attempt: u32 },
    /// An attempt is already scheduled or running
    AlreadyInProgress,
    /// Attempts exhausted
    Exhausted,
}

/// Result of one finished attempt
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub component_id: String,
    pub attempt: u32,
    /// `Ok(true)` recovered, `Ok(false)` not recovered, `Err` the action failed
    pub result: Result<bool, String>,
}

/// Per-component recovery throttle
pub struct RecoveryCoordinator {
    max_attempts: u32,
    delay: Duration,
    events: EventSink,
    attempts: HashMap<String, RecoveryAttempt>,
    tasks: JoinSet<RecoveryOutcome>,
}

impl RecoveryCoordinator {
    pub fn new(config: &RecoveryConfig, events: EventSink) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.delay(),
            events,
            attempts: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Current state of a component; components without history are idle
    pub fn state(&self, component_id: &str) -> RecoveryState {
        self.attempts
            .get(component_id)
            .map(RecoveryAttempt::state)
            .unwrap_or(RecoveryState::Idle)
    }

    pub fn attempt(&self, component_id: &str) -> Option<&RecoveryAttempt> {
        self.attempts.get(component_id)
    }

    /// Attempts scheduled or running across all components
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Schedule a recovery attempt unless one is pending or the cap is reached
    pub fn recover_component(&mut self, component: Arc<dyn HealthCheckable>) -> RecoveryDecision {
        let component_id = component.component_id().to_string();
        let entry = self
            .attempts
            .entry(component_id.clone())
            .or_insert_with(|| RecoveryAttempt::new(&component_id));

        if entry.failed {
            debug!(component = %component_id, "Recovery exhausted, not retrying");
            return RecoveryDecision::Exhausted;
        }
        if entry.in_progress {
            debug!(component = %component_id, state = %entry.state(), "Recovery already in progress");
            return RecoveryDecision::AlreadyInProgress;
        }

        entry.attempts += 1;
        entry.in_progress = true;
        entry.starts_at = Some(Instant::now() + self.delay);
        let attempt = entry.attempts;

        info!(
            component = %component_id,
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = self.delay.as_millis() as u64,
            "Recovery attempt scheduled"
        );

        let delay = self.delay;
        let events = self.events.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            events.emit(SupervisionEvent::RecoveryAttempt {
                component: component_id.clone(),
                attempt,
            });

            let action = AssertUnwindSafe(async {
                let timeout = component.recovery_timeout();
                tokio::time::timeout(timeout, component.attempt_recovery())
                    .await
                    .map_err(|_| timeout)
            })
            .catch_unwind();
            let result = match action.await {
                Ok(Ok(Ok(recovered))) => Ok(recovered),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(timeout)) => Err(format!(
                    "recovery action timed out after {}ms",
                    timeout.as_millis()
                )),
                Err(_) => Err("recovery action panicked".to_string()),
            };

            RecoveryOutcome {
                component_id,
                attempt,
                result,
            }
        });

        RecoveryDecision::Scheduled { attempt }
    }

    /// Wait for the next finished attempt; `None` when nothing is in flight
    pub async fn next_outcome(&mut self) -> Option<RecoveryOutcome> {
        loop {
            match self.tasks.join_next().await? {
                Ok(outcome) => return Some(outcome),
                Err(e) => debug!(error = %e, "Recovery task did not complete"),
            }
        }
    }

    /// Apply a finished attempt and return the component's new state
    pub fn complete(&mut self, outcome: RecoveryOutcome) -> RecoveryState {
        let Some(entry) = self.attempts.get_mut(&outcome.component_id) else {
            warn!(component = %outcome.component_id, "Recovery outcome for unknown component");
            return RecoveryState::Idle;
        };

        entry.in_progress = false;
        entry.starts_at = None;
        entry.last_attempt_at = Some(Utc::now());

        match outcome.result {
            Ok(true) => {
                let attempts = entry.attempts;
                self.attempts.remove(&outcome.component_id);
                info!(component = %outcome.component_id, attempts, "Component recovered");
                self.events.emit(SupervisionEvent::RecoverySucceeded {
                    component: outcome.component_id,
                    attempts,
                });
                RecoveryState::Idle
            }
            result => {
                let error = result.err();
                warn!(
                    component = %outcome.component_id,
                    attempt = outcome.attempt,
                    error = error.as_deref().unwrap_or("not recovered"),
                    "Recovery attempt failed"
                );
                self.events.emit(SupervisionEvent::RecoveryFailed {
                    component: outcome.component_id.clone(),
                    attempt: outcome.attempt,
                    error,
                });

                if entry.attempts >= self.max_attempts {
                    entry.failed = true;
                    error!(
                        component = %outcome.component_id,
                        attempts = entry.attempts,
                        "Component exhausted recovery attempts"
                    );
                    self.events.emit(SupervisionEvent::RecoveryExhausted {
                        component: outcome.component_id,
                        attempts: entry.attempts,
                    });
                    RecoveryState::Failed
                } else {
                    RecoveryState::Idle
                }
            }
        }
    }

    /// Forget the attempt history of a component that checked healthy.
    ///
    /// Pending attempts and exhausted components are left alone.
    pub fn reset(&mut self, component_id: &str) -> bool {
        match self.attempts.get(component_id) {
            Some(entry) if !entry.in_progress && !entry.failed => {
                debug!(component = %component_id, attempts = entry.attempts, "Recovery history cleared");
                self.attempts.remove(component_id);
                true
            }
            _ => false,
        }
    }

    /// Abort every scheduled or running attempt
    pub fn abort_all(&mut self) {
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "Aborting in-flight recovery attempts");
        }
        self.tasks.abort_all();
        for entry in self.attempts.values_mut() {
            entry.in_progress = false;
            entry.starts_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SupervisorError};
    use crate::health::HealthReport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    /// Component whose recovery succeeds after a fixed number of failures
    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
        running: AtomicUsize,
        max_running: AtomicUsize,
        work: Duration,
    }

    impl Flaky {
        fn new(failures_before_success: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_before_success,
                calls: AtomicU32::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                work: Duration::from_millis(200),
            })
        }
    }

    #[async_trait]
    impl HealthCheckable for Flaky {
        fn component_id(&self) -> &str {
            "flaky"
        }

        async fn check(&self) -> Result<HealthReport> {
            Ok(HealthReport::critical("down"))
        }

        async fn attempt_recovery(&self) -> Result<bool> {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now_running, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(call > self.failures_before_success)
        }
    }

    struct Broken;

    #[async_trait]
    impl HealthCheckable for Broken {
        fn component_id(&self) -> &str {
            "broken"
        }

        async fn check(&self) -> Result<HealthReport> {
            Ok(HealthReport::critical("down"))
        }

        async fn attempt_recovery(&self) -> Result<bool> {
            Err(SupervisorError::RecoveryAction {
                component: "broken".into(),
                reason: "connection refused".into(),
            })
        }
    }

    struct Hung;

    #[async_trait]
    impl HealthCheckable for Hung {
        fn component_id(&self) -> &str {
            "hung"
        }

        async fn check(&self) -> Result<HealthReport> {
            Ok(HealthReport::critical("down"))
        }

        async fn attempt_recovery(&self) -> Result<bool> {
            std::future::pending().await
        }

        fn recovery_timeout(&self) -> Duration {
            Duration::from_secs(2)
        }
    }

    /// Recovery that would succeed, but whose timeout lookup blows up
    struct Misconfigured;

    #[async_trait]
    impl HealthCheckable for Misconfigured {
        fn component_id(&self) -> &str {
            "misconfigured"
        }

        async fn check(&self) -> Result<HealthReport> {
            Ok(HealthReport::critical("down"))
        }

        async fn attempt_recovery(&self) -> Result<bool> {
            Ok(true)
        }

        fn recovery_timeout(&self) -> Duration {
            panic!("recovery timeout not configured")
        }
    }

    fn coordinator(max_attempts: u32) -> (RecoveryCoordinator, EventSink) {
        let events = EventSink::new(64);
        let config = RecoveryConfig {
            max_attempts,
            delay_ms: 1_000,
        };
        (RecoveryCoordinator::new(&config, events.clone()), events)
    }

    fn drain_events(rx: &mut broadcast::Receiver<SupervisionEvent>) -> Vec<SupervisionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_machine_through_success() {
        let (mut coordinator, _events) = coordinator(3);
        let flaky = Flaky::new(0);

        assert_eq!(coordinator.state("flaky"), RecoveryState::Idle);
        assert_eq!(
            coordinator.recover_component(flaky.clone()),
            RecoveryDecision::Scheduled { attempt: 1 }
        );
        assert_eq!(coordinator.state("flaky"), RecoveryState::AttemptScheduled);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(coordinator.state("flaky"), RecoveryState::Attempting);

        let outcome = coordinator.next_outcome().await.unwrap();
        assert_eq!(outcome.result, Ok(true));
        assert_eq!(coordinator.complete(outcome), RecoveryState::Idle);
        assert!(coordinator.attempt("flaky").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_requests_are_noops() {
        let (mut coordinator, _events) = coordinator(3);
        let flaky = Flaky::new(0);

        assert!(matches!(
            coordinator.recover_component(flaky.clone()),
            RecoveryDecision::Scheduled { .. }
        ));
        for _ in 0..5 {
            assert_eq!(
                coordinator.recover_component(flaky.clone()),
                RecoveryDecision::AlreadyInProgress
            );
        }
        assert_eq!(coordinator.in_flight(), 1);

        // Still a no-op while the action runs
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(
            coordinator.recover_component(flaky.clone()),
            RecoveryDecision::AlreadyInProgress
        );

        let outcome = coordinator.next_outcome().await.unwrap();
        coordinator.complete(outcome);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_concurrent_attempts() {
        let (mut coordinator, _events) = coordinator(10);
        let flaky = Flaky::new(6);

        // Detections arrive every 150ms while attempts take 1s delay + 200ms work
        let mut recovered = false;
        for _ in 0..80 {
            if recovered {
                break;
            }
            coordinator.recover_component(flaky.clone());
            assert!(coordinator.in_flight() <= 1);
            tokio::select! {
                Some(outcome) = coordinator.next_outcome() => {
                    recovered = outcome.result == Ok(true);
                    coordinator.complete(outcome);
                }
                _ = tokio::time::sleep(Duration::from_millis(150)) => {}
            }
        }

        assert!(recovered);
        assert_eq!(flaky.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 7);
        assert_eq!(coordinator.state("flaky"), RecoveryState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_fires_exactly_once() {
        let (mut coordinator, events) = coordinator(3);
        let mut rx = events.subscribe();
        let broken: Arc<dyn HealthCheckable> = Arc::new(Broken);

        let mut states = Vec::new();
        for _ in 0..3 {
            assert!(matches!(
                coordinator.recover_component(broken.clone()),
                RecoveryDecision::Scheduled { .. }
            ));
            let outcome = coordinator.next_outcome().await.unwrap();
            assert!(outcome.result.is_err());
            states.push(coordinator.complete(outcome));
        }
        assert_eq!(
            states,
            vec![RecoveryState::Idle, RecoveryState::Idle, RecoveryState::Failed]
        );

        // Further detections never schedule anything
        for _ in 0..5 {
            assert_eq!(
                coordinator.recover_component(broken.clone()),
                RecoveryDecision::Exhausted
            );
        }
        assert_eq!(coordinator.in_flight(), 0);

        let exhausted = drain_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SupervisionEvent::RecoveryExhausted { .. }))
            .count();
        assert_eq!(exhausted, 1);
        assert_eq!(coordinator.attempt("broken").unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_timeout_counts_as_failure() {
        let (mut coordinator, _events) = coordinator(2);
        coordinator.recover_component(Arc::new(Hung));

        let outcome = coordinator.next_outcome().await.unwrap();
        let error = outcome.result.clone().unwrap_err();
        assert!(error.contains("timed out"), "{error}");
        assert_eq!(coordinator.complete(outcome), RecoveryState::Idle);
        assert_eq!(coordinator.attempt("hung").unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_clears_in_progress() {
        let (mut coordinator, _events) = coordinator(3);
        let flaky = Flaky::new(0);
        coordinator.recover_component(flaky.clone());

        coordinator.abort_all();
        assert!(coordinator.next_outcome().await.is_none());
        assert_eq!(coordinator.state("flaky"), RecoveryState::Idle);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_timeout_lookup_counts_as_failure() {
        let (mut coordinator, _events) = coordinator(2);
        let component: Arc<dyn HealthCheckable> = Arc::new(Misconfigured);
        coordinator.recover_component(component.clone());

        let outcome = coordinator.next_outcome().await.unwrap();
        assert_eq!(outcome.result, Err("recovery action panicked".to_string()));
        assert_eq!(coordinator.complete(outcome), RecoveryState::Idle);
        assert_eq!(coordinator.in_flight(), 0);

        // The entry is not left in progress
        assert_eq!(
            coordinator.recover_component(component),
            RecoveryDecision::Scheduled { attempt: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_check_resets_attempt_count() {
        let (mut coordinator, events) = coordinator(2);
        let mut rx = events.subscribe();
        let broken: Arc<dyn HealthCheckable> = Arc::new(Broken);

        coordinator.recover_component(broken.clone());
        let outcome = coordinator.next_outcome().await.unwrap();
        assert_eq!(coordinator.complete(outcome), RecoveryState::Idle);
        assert_eq!(coordinator.attempt("broken").unwrap().attempts, 1);

        assert!(coordinator.reset("broken"));
        assert!(coordinator.attempt("broken").is_none());

        // A later outage starts counting from one again
        assert_eq!(
            coordinator.recover_component(broken.clone()),
            RecoveryDecision::Scheduled { attempt: 1 }
        );
        assert!(!coordinator.reset("broken"));
        let outcome = coordinator.next_outcome().await.unwrap();
        assert_eq!(coordinator.complete(outcome), RecoveryState::Idle);

        // Back-to-back failures still exhaust, and failed stays failed
        assert_eq!(
            coordinator.recover_component(broken.clone()),
            RecoveryDecision::Scheduled { attempt: 2 }
        );
        let outcome = coordinator.next_outcome().await.unwrap();
        assert_eq!(coordinator.complete(outcome), RecoveryState::Failed);
        assert!(!coordinator.reset("broken"));
        assert_eq!(coordinator.state("broken"), RecoveryState::Failed);

        let exhausted = drain_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SupervisionEvent::RecoveryExhausted { .. }))
            .count();
        assert_eq!(exhausted, 1);
    }

    #[test]
    fn test_reset_without_history_is_a_noop() {
        let (mut coordinator, _events) = coordinator(2);
        assert!(!coordinator.reset("never_seen"));
    }
}

//! Component Health Monitor
//!
//! Polls every registered component on a fixed interval, aggregates the
//! results, publishes a snapshot and hands unhealthy components to the
//! recovery coordinator. The monitor task is the only writer of the component
//! table; readers get immutable snapshots through a `watch` channel.

use super::recovery::{RecoveryCoordinator, RecoveryOutcome};
use super::{ComponentHealth, HealthCheckable, HealthReport, HealthSnapshot, HealthStatus, OverallHealth};
use crate::config::HealthConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{EventSink, SupervisionEvent};
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Periodic multi-component health monitor
pub struct ComponentHealthMonitor {
    config: HealthConfig,
    components: Vec<Arc<dyn HealthCheckable>>,
    health: OverallHealth,
    recovery: RecoveryCoordinator,
    events: EventSink,
    snapshot_tx: watch::Sender<HealthSnapshot>,
    threshold_fired: bool,
}

impl ComponentHealthMonitor {
    pub fn new(config: HealthConfig, recovery: RecoveryCoordinator, events: EventSink) -> Self {
        let (snapshot_tx, _) = watch::channel(HealthSnapshot::default());
        Self {
            config,
            components: Vec::new(),
            health: OverallHealth::default(),
            recovery,
            events,
            snapshot_tx,
            threshold_fired: false,
        }
    }

    /// Register a component; ids must be unique
    pub fn register(&mut self, component: Arc<dyn HealthCheckable>) -> Result<()> {
        let id = component.component_id().to_string();
        if self.health.components.contains_key(&id) {
            return Err(SupervisorError::Validation(format!(
                "health component '{id}' registered twice"
            )));
        }
        self.health
            .components
            .insert(id.clone(), ComponentHealth::new(&id));
        self.components.push(component);
        debug!(component = %id, "Registered component for health monitoring");
        Ok(())
    }

    pub fn health(&self) -> &OverallHealth {
        &self.health
    }

    pub fn recovery(&self) -> &RecoveryCoordinator {
        &self.recovery
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Probe every component concurrently and recompute the overall status
    pub async fn check_all(&mut self) -> &OverallHealth {
        let started = Instant::now();
        let timeout = self.config.check_timeout();

        let probes = self.components.iter().map(|component| {
            let component = Arc::clone(component);
            async move {
                let id = component.component_id().to_string();
                let report = probe(component.as_ref(), timeout).await;
                (id, report)
            }
        });
        let reports = join_all(probes).await;

        let checked_at = Utc::now();
        for (id, report) in reports {
            if let Some(entry) = self.health.components.get_mut(&id) {
                entry.apply(report, checked_at);
            }
        }
        self.health.recompute(checked_at);

        let duration = started.elapsed();
        self.publish(duration);
        &self.health
    }

    /// One full monitor cycle: check, then dispatch recovery
    pub async fn run_cycle(&mut self) {
        self.check_all().await;
        self.dispatch_recovery();
    }

    fn publish(&mut self, duration: Duration) {
        let snapshot = self.health.snapshot();
        let status = self.health.status;
        let consecutive_failures = self.health.consecutive_failures;
        let duration_ms = duration.as_millis() as u64;

        match status {
            HealthStatus::Healthy => debug!(duration_ms, "Health cycle: healthy"),
            HealthStatus::Degraded | HealthStatus::Unknown => {
                for c in self.health.unhealthy_components() {
                    warn!(component = %c.component_id, status = %c.status, message = c.message.as_deref().unwrap_or(""), "Component degraded");
                }
                warn!(consecutive_failures, duration_ms, "Health cycle: degraded");
            }
            HealthStatus::Critical => {
                for c in self.health.unhealthy_components() {
                    error!(component = %c.component_id, status = %c.status, message = c.message.as_deref().unwrap_or(""), "Component unhealthy");
                }
                error!(consecutive_failures, duration_ms, "Health cycle: critical");
            }
        }

        self.snapshot_tx.send_replace(snapshot.clone());
        self.events.emit(SupervisionEvent::HealthCycle {
            snapshot,
            duration_ms,
        });

        if status.is_healthy() {
            self.threshold_fired = false;
        } else if consecutive_failures >= self.config.failure_threshold && !self.threshold_fired {
            self.threshold_fired = true;
            error!(
                consecutive_failures,
                threshold = self.config.failure_threshold,
                "Health failure threshold reached"
            );
            self.events.emit(SupervisionEvent::HealthThresholdExceeded {
                status,
                consecutive_failures,
            });
        }
    }

    /// Hand every non-healthy component to the recovery coordinator
    fn dispatch_recovery(&mut self) {
        let healthy: Vec<String> = self
            .health
            .components
            .values()
            .filter(|c| c.status.is_healthy())
            .map(|c| c.component_id.clone())
            .collect();
        for id in healthy {
            self.recovery.reset(&id);
        }

        let unhealthy: Vec<String> = self
            .health
            .unhealthy_components()
            .map(|c| c.component_id.clone())
            .collect();

        for id in unhealthy {
            if let Some(component) = self.components.iter().find(|c| c.component_id() == id) {
                self.recovery.recover_component(Arc::clone(component));
            }
        }
    }

    fn apply_recovery(&mut self, outcome: RecoveryOutcome) {
        self.recovery.complete(outcome);
    }

    /// Run the monitor loop on its own task
    pub fn spawn(self) -> MonitorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let snapshot_rx = self.subscribe();
        let task = tokio::spawn(self.run(stop_rx));
        MonitorHandle {
            stop_tx,
            snapshot_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        let interval = self.config.check_interval();
        info!(
            components = self.components.len(),
            interval_ms = interval.as_millis() as u64,
            "Health monitor started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                Some(outcome) = self.recovery.next_outcome() => self.apply_recovery(outcome),
                _ = ticker.tick() => self.run_cycle().await,
            }
        }

        self.recovery.abort_all();
        info!("Health monitor stopped");
    }
}

/// Run one check bounded by `timeout`; every failure mode becomes `critical`
async fn probe(component: &dyn HealthCheckable, timeout: Duration) -> HealthReport {
    let check = AssertUnwindSafe(component.check()).catch_unwind();
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(Ok(report))) => report,
        Ok(Ok(Err(e))) => HealthReport::critical(format!("check failed: {e}")),
        Ok(Err(_)) => HealthReport::critical("check panicked"),
        Err(_) => HealthReport::critical(format!(
            "check timed out after {}ms",
            timeout.as_millis()
        )),
    }
}

/// Handle to a running monitor task
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    snapshot_rx: watch::Receiver<HealthSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Stop the ticker, abort in-flight recoveries and wait for the task
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Component returning a scripted status
    struct Scripted {
        id: &'static str,
        status: std::sync::Mutex<HealthStatus>,
        recoveries: AtomicU32,
        recover_to: Option<HealthStatus>,
    }

    impl Scripted {
        fn new(id: &'static str, status: HealthStatus) -> Arc<Self> {
            Arc::new(Self {
                id,
                status: std::sync::Mutex::new(status),
                recoveries: AtomicU32::new(0),
                recover_to: None,
            })
        }

        fn recovering(id: &'static str, status: HealthStatus) -> Arc<Self> {
            Arc::new(Self {
                id,
                status: std::sync::Mutex::new(status),
                recoveries: AtomicU32::new(0),
                recover_to: Some(HealthStatus::Healthy),
            })
        }

        fn set(&self, status: HealthStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    #[async_trait]
    impl HealthCheckable for Scripted {
        fn component_id(&self) -> &str {
            self.id
        }

        async fn check(&self) -> Result<HealthReport> {
            let status = *self.status.lock().unwrap();
            Ok(HealthReport::new(status, Some(format!("{} is {status}", self.id))))
        }

        async fn attempt_recovery(&self) -> Result<bool> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            match self.recover_to {
                Some(status) => {
                    self.set(status);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl HealthCheckable for Slow {
        fn component_id(&self) -> &str {
            "slow"
        }

        async fn check(&self) -> Result<HealthReport> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HealthReport::healthy())
        }
    }

    struct Failing;

    #[async_trait]
    impl HealthCheckable for Failing {
        fn component_id(&self) -> &str {
            "failing"
        }

        async fn check(&self) -> Result<HealthReport> {
            Err(SupervisorError::ComponentCheck {
                component: "failing".into(),
                reason: "connection refused".into(),
            })
        }
    }

    struct Panicking;

    #[async_trait]
    impl HealthCheckable for Panicking {
        fn component_id(&self) -> &str {
            "panicking"
        }

        async fn check(&self) -> Result<HealthReport> {
            panic!("probe bug")
        }
    }

    fn monitor(failure_threshold: u32) -> (ComponentHealthMonitor, EventSink) {
        let events = EventSink::new(256);
        let config = HealthConfig {
            check_interval_ms: 1_000,
            check_timeout_ms: 500,
            failure_threshold,
            ..HealthConfig::default()
        };
        let recovery = RecoveryCoordinator::new(
            &RecoveryConfig {
                max_attempts: 2,
                delay_ms: 100,
            },
            events.clone(),
        );
        (
            ComponentHealthMonitor::new(config, recovery, events.clone()),
            events,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_all_aggregates() {
        let (mut monitor, _events) = monitor(3);
        let db = Scripted::new("db", HealthStatus::Healthy);
        let cache = Scripted::new("cache", HealthStatus::Healthy);
        monitor.register(db.clone()).unwrap();
        monitor.register(cache.clone()).unwrap();

        assert_eq!(monitor.check_all().await.status, HealthStatus::Healthy);

        cache.set(HealthStatus::Degraded);
        let health = monitor.check_all().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.consecutive_failures, 1);

        db.set(HealthStatus::Critical);
        let health = monitor.check_all().await;
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.components["db"].consecutive_failures, 1);
        assert_eq!(health.components["cache"].consecutive_failures, 2);

        db.set(HealthStatus::Healthy);
        cache.set(HealthStatus::Healthy);
        assert_eq!(monitor.check_all().await.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failures_become_critical() {
        let (mut monitor, _events) = monitor(3);
        monitor.register(Arc::new(Slow)).unwrap();
        monitor.register(Arc::new(Failing)).unwrap();
        monitor.register(Arc::new(Panicking)).unwrap();
        monitor.register(Scripted::new("ok", HealthStatus::Healthy)).unwrap();

        let started = tokio::time::Instant::now();
        let health = monitor.check_all().await;
        // All probes run concurrently, bounded by the per-check timeout
        assert!(started.elapsed() < Duration::from_millis(600));

        assert_eq!(health.status, HealthStatus::Critical);
        let slow = &health.components["slow"];
        assert_eq!(slow.status, HealthStatus::Critical);
        assert!(slow.message.as_deref().unwrap().contains("timed out"));
        let failing = &health.components["failing"];
        assert!(failing.message.as_deref().unwrap().contains("connection refused"));
        assert_eq!(health.components["panicking"].status, HealthStatus::Critical);
        assert_eq!(health.components["ok"].status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_rejected() {
        let (mut monitor, _events) = monitor(3);
        monitor.register(Scripted::new("db", HealthStatus::Healthy)).unwrap();
        assert!(monitor.register(Scripted::new("db", HealthStatus::Healthy)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_event_fires_once_per_streak() {
        let (mut monitor, events) = monitor(2);
        let mut rx = events.subscribe();
        let db = Scripted::new("db", HealthStatus::Critical);
        monitor.register(db.clone()).unwrap();

        for _ in 0..5 {
            monitor.check_all().await;
        }
        db.set(HealthStatus::Healthy);
        monitor.check_all().await;
        db.set(HealthStatus::Degraded);
        for _ in 0..2 {
            monitor.check_all().await;
        }

        let mut cycles = 0;
        let mut thresholds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SupervisionEvent::HealthCycle { .. } => cycles += 1,
                SupervisionEvent::HealthThresholdExceeded {
                    consecutive_failures,
                    ..
                } => thresholds.push(consecutive_failures),
                _ => {}
            }
        }
        assert_eq!(cycles, 8);
        assert_eq!(thresholds, vec![2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_recovers_component() {
        let (mut monitor, _events) = monitor(3);
        let db = Scripted::recovering("db", HealthStatus::Critical);
        monitor.register(db.clone()).unwrap();

        let handle = monitor.spawn();
        let mut rx = handle.subscribe();

        // First cycle sees the outage, recovery runs 100ms later, the next cycle is healthy
        rx.wait_for(|s| s.overall == HealthStatus::Critical).await.unwrap();
        rx.wait_for(|s| s.overall == HealthStatus::Healthy).await.unwrap();
        assert_eq!(db.recoveries.load(Ordering::SeqCst), 1);

        handle.stop().await;
        assert_eq!(handle.snapshot().overall, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_keeps_running_when_everything_is_down() {
        let (mut monitor, _events) = monitor(3);
        let db = Scripted::new("db", HealthStatus::Critical);
        monitor.register(db.clone()).unwrap();
        monitor.register(Arc::new(Failing)).unwrap();

        let handle = monitor.spawn();
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.consecutive_failures >= 10).await.unwrap();

        // Two attempts each, then frozen
        assert_eq!(db.recoveries.load(Ordering::SeqCst), 2);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_deterministic() {
        let (mut monitor, _events) = monitor(3);
        monitor.register(Scripted::new("db", HealthStatus::Healthy)).unwrap();
        let handle = monitor.spawn();
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.last_check.is_some()).await.unwrap();

        handle.stop().await;
        let last = handle.snapshot().last_check;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.snapshot().last_check, last);

        // Stopping twice is harmless
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_component_is_recovered() {
        let (mut monitor, _events) = monitor(3);
        let legacy = Scripted::recovering("legacy", HealthStatus::Unknown);
        monitor.register(legacy.clone()).unwrap();

        let handle = monitor.spawn();
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.overall == HealthStatus::Degraded).await.unwrap();
        rx.wait_for(|s| s.overall == HealthStatus::Healthy).await.unwrap();
        assert_eq!(legacy.recoveries.load(Ordering::SeqCst), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_healed_component_starts_recovery_over() {
        let (mut monitor, events) = monitor(3);
        let mut rx = events.subscribe();
        let db = Scripted::new("db", HealthStatus::Critical);
        monitor.register(db.clone()).unwrap();
        let handle = monitor.spawn();

        // Cycles run every second and attempts fire 100ms after detection
        tokio::time::sleep(Duration::from_millis(500)).await;
        db.set(HealthStatus::Healthy);
        tokio::time::sleep(Duration::from_secs(1)).await;
        db.set(HealthStatus::Critical);
        tokio::time::sleep(Duration::from_secs(1)).await;
        db.set(HealthStatus::Healthy);
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.stop().await;

        let mut attempts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SupervisionEvent::RecoveryAttempt { component, attempt } if component == "db" => {
                    attempts.push(attempt)
                }
                SupervisionEvent::RecoveryExhausted { .. } => {
                    panic!("separate outages are not consecutive failures")
                }
                _ => {}
            }
        }
        assert_eq!(attempts, vec![1, 1]);
        assert_eq!(db.recoveries.load(Ordering::SeqCst), 2);
    }
}

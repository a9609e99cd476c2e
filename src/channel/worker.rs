//! Worker-side protocol runtime
//!
//! Runs inside each worker next to its business logic. Announces readiness,
//! answers health checks, pushes metrics read from explicit counters, and on
//! `shutdown` stops accepting work and drains what is in flight.

use super::{SupervisorMessage, WorkerEndpoint, WorkerMessage, WorkerMetrics};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval while waiting for in-flight work to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Request counters threaded through the worker's request path
#[derive(Debug)]
pub struct WorkerCounters {
    accepting: AtomicBool,
    in_flight: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl Default for WorkerCounters {
    fn default() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            in_flight: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

impl WorkerCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admit a request; `None` once the worker stopped accepting work
    pub fn begin_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.requests.fetch_add(1, Ordering::Relaxed);
        Some(RequestGuard {
            counters: Arc::clone(self),
            failed: false,
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Tracks one in-flight request; dropping it completes the request
#[derive(Debug)]
pub struct RequestGuard {
    counters: Arc<WorkerCounters>,
    failed: bool,
}

impl RequestGuard {
    /// Complete the request as failed
    pub fn fail(mut self) {
        self.failed = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.failed {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    pub metrics_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_millis(1_500),
        }
    }
}

type MemoryProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Why the runtime stopped serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    SupervisorGone,
    Local,
}

/// Worker side of the health channel
pub struct WorkerRuntime {
    config: WorkerRuntimeConfig,
    counters: Arc<WorkerCounters>,
    memory_probe: MemoryProbe,
}

impl WorkerRuntime {
    pub fn new(config: WorkerRuntimeConfig, counters: Arc<WorkerCounters>) -> Self {
        Self {
            config,
            counters,
            memory_probe: Arc::new(crate::health::checks::current_process_memory),
        }
    }

    /// Replace the memory reading used in metrics pushes
    pub fn with_memory_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.memory_probe = Arc::new(probe);
        self
    }

    pub fn counters(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.counters)
    }

    fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            memory_bytes: (self.memory_probe)(),
            request_count: self.counters.request_count(),
            error_count: self.counters.error_count(),
        }
    }

    /// Serve the protocol until the supervisor asks for shutdown or hangs up
    pub async fn run(self, endpoint: WorkerEndpoint) -> i32 {
        self.run_until(endpoint, std::future::pending()).await
    }

    /// Serve the protocol; `stop` resolving is treated like a shutdown request
    ///
    /// Returns the process exit code: 0 when in-flight work drained in time.
    pub async fn run_until<F>(self, mut endpoint: WorkerEndpoint, stop: F) -> i32
    where
        F: Future<Output = ()> + Send,
    {
        if endpoint.send(WorkerMessage::Ready).await.is_err() {
            warn!("Supervisor gone before worker became ready");
            return 1;
        }
        debug!("Worker ready");

        let period = self.config.metrics_interval;
        let mut metrics_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(stop);

        let reason = loop {
            tokio::select! {
                msg = endpoint.recv() => match msg {
                    Some(SupervisorMessage::HealthCheck) => {
                        let healthy = self.counters.is_accepting();
                        if !endpoint.try_send(WorkerMessage::Health { healthy }) {
                            debug!("Health reply lost");
                        }
                    }
                    Some(SupervisorMessage::Shutdown) => break StopReason::Requested,
                    None => break StopReason::SupervisorGone,
                },
                _ = metrics_tick.tick() => {
                    if !endpoint.try_send(WorkerMessage::Metrics(self.metrics())) {
                        debug!("Metrics push lost");
                    }
                }
                _ = &mut stop => break StopReason::Local,
            }
        };

        info!(reason = ?reason, in_flight = self.counters.in_flight(), "Worker stopping");
        if self.drain().await {
            0
        } else {
            1
        }
    }

    /// Stop admitting requests and wait for in-flight ones
    async fn drain(&self) -> bool {
        self.counters.stop_accepting();
        let counters = Arc::clone(&self.counters);
        let drained = tokio::time::timeout(self.config.drain_timeout, async move {
            while counters.in_flight() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                in_flight = self.counters.in_flight(),
                timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "Drain timed out with requests still in flight"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pair;

    fn runtime(counters: Arc<WorkerCounters>) -> WorkerRuntime {
        WorkerRuntime::new(
            WorkerRuntimeConfig {
                metrics_interval: Duration::from_secs(5),
                drain_timeout: Duration::from_secs(1),
            },
            counters,
        )
        .with_memory_probe(|| 4096)
    }

    #[test]
    fn test_counters_track_requests() {
        let counters = WorkerCounters::new();
        let ok = counters.begin_request().unwrap();
        let bad = counters.begin_request().unwrap();
        assert_eq!(counters.in_flight(), 2);

        drop(ok);
        bad.fail();
        assert_eq!(counters.in_flight(), 0);
        assert_eq!(counters.request_count(), 2);
        assert_eq!(counters.error_count(), 1);

        counters.stop_accepting();
        assert!(counters.begin_request().is_none());
        assert_eq!(counters.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_answers_and_reports() {
        let (mut supervisor, worker) = pair(8);
        let counters = WorkerCounters::new();
        let handle = tokio::spawn(runtime(Arc::clone(&counters)).run(worker));

        assert_eq!(supervisor.recv().await, Some(WorkerMessage::Ready));

        supervisor.send(SupervisorMessage::HealthCheck).await.unwrap();
        assert_eq!(
            supervisor.recv().await,
            Some(WorkerMessage::Health { healthy: true })
        );

        drop(counters.begin_request());
        assert_eq!(
            supervisor.recv().await,
            Some(WorkerMessage::Metrics(WorkerMetrics {
                memory_bytes: 4096,
                request_count: 1,
                error_count: 0,
            }))
        );

        supervisor.send(SupervisorMessage::Shutdown).await.unwrap();
        assert_eq!(handle.await.unwrap(), 0);
        assert!(!counters.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_work() {
        let (mut supervisor, worker) = pair(8);
        let counters = WorkerCounters::new();
        let guard = counters.begin_request().unwrap();
        let handle = tokio::spawn(runtime(Arc::clone(&counters)).run(worker));
        assert_eq!(supervisor.recv().await, Some(WorkerMessage::Ready));

        supervisor.send(SupervisorMessage::Shutdown).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());

        drop(guard);
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_reports_failure() {
        let (mut supervisor, worker) = pair(8);
        let counters = WorkerCounters::new();
        let _stuck = counters.begin_request().unwrap();
        let handle = tokio::spawn(runtime(Arc::clone(&counters)).run(worker));
        assert_eq!(supervisor.recv().await, Some(WorkerMessage::Ready));

        let started = tokio::time::Instant::now();
        supervisor.send(SupervisorMessage::Shutdown).await.unwrap();
        assert_eq!(handle.await.unwrap(), 1);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(!counters.is_accepting());
        assert_eq!(counters.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_hangup_drains() {
        let (mut supervisor, worker) = pair(8);
        let counters = WorkerCounters::new();
        let handle = tokio::spawn(runtime(Arc::clone(&counters)).run(worker));
        assert_eq!(supervisor.recv().await, Some(WorkerMessage::Ready));

        drop(supervisor);
        assert_eq!(handle.await.unwrap(), 0);
        assert!(!counters.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_stop_drains() {
        let (mut supervisor, worker) = pair(8);
        let stop = tokio::time::sleep(Duration::from_secs(2));
        let code = tokio::spawn(runtime(WorkerCounters::new()).run_until(worker, stop));
        assert_eq!(supervisor.recv().await, Some(WorkerMessage::Ready));
        assert_eq!(code.await.unwrap(), 0);
    }
}

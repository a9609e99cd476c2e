//! Worker Supervisor
//!
//! One task owns the worker table. Commands from [`SupervisorHandle`], worker
//! messages and exit notifications all arrive as channel messages, and every
//! timer (restart backoff, liveness deadline, grace kill, shutdown deadline)
//! is a deadline the loop sleeps towards. Readers get a [`PoolSnapshot`]
//! published after every turn of the loop.

use super::launcher::{LaunchedWorker, WorkerExit, WorkerLauncher, WorkerSpec};
use crate::channel::{SupervisorMessage, WorkerMessage, WorkerMetrics};
use crate::config::PoolConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{EventSink, SupervisionEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Backoff never grows past this multiple of the base delay
const MAX_BACKOFF_STEPS: u32 = 5;

const COMMAND_BUFFER: usize = 32;

/// Restart delay after `restarts_so_far` restarts of a slot
pub fn restart_delay(base: Duration, cap: Duration, restarts_so_far: u32) -> Duration {
    let steps = restarts_so_far.saturating_add(1).min(MAX_BACKOFF_STEPS);
    base.saturating_mul(steps).min(cap)
}

/// Lifecycle of a worker while it is in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Launched, `ready` not received yet
    Starting,
    Online,
    /// Missed its liveness window; kill sent
    Unresponsive,
    /// Asked to shut down; waiting for exit
    Stopping,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Online => write!(f, "online"),
            WorkerStatus::Unresponsive => write!(f, "unresponsive"),
            WorkerStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Read-only view of one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: u64,
    pub slot: usize,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub restart_count: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub last_metrics: Option<WorkerMetrics>,
}

/// Read-only view of the pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub desired_workers: usize,
    pub shutting_down: bool,
    pub pending_restarts: usize,
    /// Live workers ordered by slot
    pub workers: Vec<WorkerSnapshot>,
}

impl PoolSnapshot {
    pub fn online_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Online)
            .count()
    }

    pub fn worker_in_slot(&self, slot: usize) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.slot == slot)
    }

    /// All desired slots are staffed by online workers
    pub fn is_fully_online(&self) -> bool {
        !self.shutting_down && self.online_count() == self.desired_workers
    }
}

enum Command {
    Resize {
        workers: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Kill {
        id: u64,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        deadline: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Fed by the per-worker forwarding tasks
enum PoolEvent {
    Message { id: u64, msg: WorkerMessage },
    Exited { id: u64, exit: WorkerExit },
}

struct Worker {
    id: u64,
    slot: usize,
    pid: Option<u32>,
    status: WorkerStatus,
    tx: mpsc::Sender<SupervisorMessage>,
    kill: Option<oneshot::Sender<()>>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    last_heartbeat: Instant,
    metrics: Option<WorkerMetrics>,
    /// Force-kill at this instant unless the worker exits first
    kill_at: Option<Instant>,
}

impl Worker {
    /// Kill the worker; only the first call has an effect
    fn force_kill(&mut self) -> bool {
        match self.kill.take() {
            Some(kill) => {
                let _ = kill.send(());
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    restarts: u32,
    worker: Option<u64>,
    restart_at: Option<Instant>,
}

struct PendingShutdown {
    deadline_at: Instant,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// Pool supervisor; runs as a single task behind a [`SupervisorHandle`]
pub struct WorkerSupervisor {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    events: EventSink,
    desired: usize,
    next_id: u64,
    workers: BTreeMap<u64, Worker>,
    slots: Vec<Slot>,
    shutting_down: bool,
    shutdown: Option<PendingShutdown>,
    finished: bool,
    pool_tx: mpsc::UnboundedSender<PoolEvent>,
    pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
}

impl WorkerSupervisor {
    /// Launch the initial pool and start supervising it
    ///
    /// Failing to launch any initial worker is a bootstrap error; workers
    /// already started are killed.
    pub async fn start(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        events: EventSink,
    ) -> Result<SupervisorHandle> {
        if config.desired_workers == 0 || config.desired_workers > config.max_workers {
            return Err(SupervisorError::Bootstrap(format!(
                "desired_workers must be within 1..={}, got {}",
                config.max_workers, config.desired_workers
            )));
        }

        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot::default());
        let desired = config.desired_workers;

        let mut supervisor = Self {
            config,
            launcher,
            events,
            desired,
            next_id: 1,
            workers: BTreeMap::new(),
            slots: (0..desired).map(|_| Slot::default()).collect(),
            shutting_down: false,
            shutdown: None,
            finished: false,
            pool_tx,
            pool_rx,
            snapshot_tx,
        };

        for slot in 0..desired {
            if let Err(e) = supervisor.spawn_worker(slot).await {
                error!(slot, error = %e, "Initial worker launch failed");
                supervisor.kill_all();
                return Err(SupervisorError::Bootstrap(format!(
                    "failed to launch initial worker pool: {e}"
                )));
            }
        }

        info!(
            workers = desired,
            max_workers = supervisor.config.max_workers,
            "Worker pool started"
        );
        supervisor.publish();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(supervisor.run(cmd_rx));

        Ok(SupervisorHandle {
            cmd_tx,
            snapshot_rx,
        })
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let interval = self.config.health_check_interval();
        let mut probe = tokio::time::interval_at(Instant::now() + interval, interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.finished {
            let wake_at = self.next_wakeup();
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        warn!("All supervisor handles dropped, killing workers");
                        self.kill_all();
                        break;
                    }
                },
                Some(event) = self.pool_rx.recv() => self.handle_pool_event(event).await,
                _ = probe.tick(), if !self.shutting_down => self.health_probe(),
                _ = sleep_until(wake_at) => self.on_timer().await,
            }
            self.publish();
        }

        debug!("Supervisor loop finished");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Resize { workers, reply } => {
                let result = self.resize(workers).await;
                let _ = reply.send(result);
            }
            Command::Kill { id, reply } => {
                let killed = match self.workers.get_mut(&id) {
                    Some(worker) => {
                        warn!(id, slot = worker.slot, "Force-killing worker on request");
                        worker.force_kill()
                    }
                    None => false,
                };
                let _ = reply.send(killed);
            }
            Command::Shutdown { deadline, reply } => self.begin_shutdown(deadline, reply),
        }
    }

    async fn handle_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Message { id, msg } => self.on_message(id, msg),
            PoolEvent::Exited { id, exit } => self.on_worker_exit(id, exit).await,
        }
    }

    fn on_message(&mut self, id: u64, msg: WorkerMessage) {
        let memory_limit = self.config.memory_limit_bytes;
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };

        match msg {
            WorkerMessage::Ready => {
                worker.last_heartbeat = Instant::now();
                if worker.status == WorkerStatus::Starting {
                    worker.status = WorkerStatus::Online;
                    info!(id, slot = worker.slot, pid = ?worker.pid, "Worker online");
                    self.events.emit(SupervisionEvent::WorkerOnline {
                        id,
                        slot: worker.slot,
                        pid: worker.pid,
                    });
                }
            }
            WorkerMessage::Health { healthy: true } => {
                worker.last_heartbeat = Instant::now();
            }
            WorkerMessage::Health { healthy: false } => {
                debug!(id, slot = worker.slot, "Worker reported itself unhealthy");
            }
            // Metrics are unsolicited and never count as a liveness reply
            WorkerMessage::Metrics(metrics) => {
                worker.metrics = Some(metrics);
                if metrics.memory_bytes > memory_limit {
                    warn!(
                        id,
                        slot = worker.slot,
                        memory_bytes = metrics.memory_bytes,
                        limit_bytes = memory_limit,
                        "Worker memory above limit"
                    );
                    self.events.emit(SupervisionEvent::WorkerMemoryExceeded {
                        id,
                        memory_bytes: metrics.memory_bytes,
                        limit_bytes: memory_limit,
                    });
                }
            }
        }
    }

    async fn on_worker_exit(&mut self, id: u64, exit: WorkerExit) {
        let Some(worker) = self.workers.remove(&id) else {
            return;
        };
        let slot = worker.slot;
        let expected = self.shutting_down || slot >= self.desired;
        let lifetime = worker.started_at.elapsed();

        if expected || exit.is_clean() {
            info!(id, slot, exit = %exit, expected, "Worker exited");
        } else {
            let err = SupervisorError::WorkerExit {
                id,
                code: exit.code,
                signal: exit.signal,
            };
            error!(slot, exit = %exit, uptime_ms = lifetime.as_millis() as u64, "{err}");
        }
        self.events.emit(SupervisionEvent::WorkerExited {
            id,
            slot,
            code: exit.code,
            signal: exit.signal,
            expected,
        });

        if let Some(entry) = self.slots.get_mut(slot) {
            entry.worker = None;
        }

        if self.shutting_down {
            if self.workers.is_empty() {
                self.finish_shutdown(0);
            }
            return;
        }
        if slot >= self.desired {
            self.trim_slots();
            return;
        }

        if lifetime >= self.config.restart_reset_after() {
            if let Some(entry) = self.slots.get_mut(slot) {
                entry.restarts = 0;
            }
        }
        self.schedule_restart(slot);
    }

    fn schedule_restart(&mut self, slot: usize) {
        let base = self.config.restart_base_delay();
        let cap = self.config.restart_max_delay();
        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };

        let delay = restart_delay(base, cap, entry.restarts);
        entry.restarts += 1;
        entry.restart_at = Some(Instant::now() + delay);

        info!(
            slot,
            delay_ms = delay.as_millis() as u64,
            restart_count = entry.restarts,
            "Worker restart scheduled"
        );
        self.events.emit(SupervisionEvent::WorkerRestartScheduled {
            slot,
            delay_ms: delay.as_millis() as u64,
            restart_count: entry.restarts,
        });
    }

    /// Launch a worker into `slot` and start forwarding its channel
    async fn spawn_worker(&mut self, slot: usize) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;

        let spec = WorkerSpec {
            id,
            slot,
            channel_capacity: self.config.channel_capacity,
        };
        let LaunchedWorker {
            pid,
            endpoint,
            exit,
            kill,
        } = self.launcher.launch(spec).await?;

        let (tx, rx) = endpoint.split();
        tokio::spawn(forward(id, rx, exit, self.pool_tx.clone()));

        let now = Instant::now();
        let restarts = self.slots.get(slot).map(|s| s.restarts).unwrap_or(0);
        self.workers.insert(
            id,
            Worker {
                id,
                slot,
                pid,
                status: WorkerStatus::Starting,
                tx,
                kill: Some(kill),
                started_at: now,
                started_wall: Utc::now(),
                last_heartbeat: now,
                metrics: None,
                kill_at: None,
            },
        );
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.worker = Some(id);
        }

        debug!(id, slot, pid = ?pid, restarts, "Worker launched");
        Ok(id)
    }

    /// Launch into a slot; a failed launch is handled like an abnormal exit
    async fn fill_slot(&mut self, slot: usize) {
        if let Err(e) = self.spawn_worker(slot).await {
            error!(slot, error = %e, "Worker launch failed");
            self.schedule_restart(slot);
        }
    }

    fn health_probe(&mut self) {
        for worker in self.workers.values() {
            if worker.status == WorkerStatus::Unresponsive {
                continue;
            }
            if worker.tx.try_send(SupervisorMessage::HealthCheck).is_err() {
                debug!(id = worker.id, "Health check not delivered");
            }
        }
    }

    /// Earliest instant any timer of the pool is due
    fn next_wakeup(&self) -> Option<Instant> {
        let unresponsive_after = self.config.unresponsive_after();
        let liveness = self
            .workers
            .values()
            .filter(|w| !self.shutting_down && w.kill.is_some())
            .filter(|w| matches!(w.status, WorkerStatus::Starting | WorkerStatus::Online))
            .map(|w| w.last_heartbeat + unresponsive_after);
        let kills = self.workers.values().filter_map(|w| w.kill_at);
        let restarts = self.slots.iter().filter_map(|s| s.restart_at);
        let deadline = self.shutdown.as_ref().map(|s| s.deadline_at);

        liveness.chain(kills).chain(restarts).chain(deadline).min()
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if let Some(shutdown) = &self.shutdown {
            if now >= shutdown.deadline_at {
                let remaining = self.workers.len();
                error!(remaining, "Worker pool shutdown deadline exceeded");
                self.kill_all();
                self.finish_shutdown(remaining);
                return;
            }
        }

        for worker in self.workers.values_mut() {
            if worker.kill_at.is_some_and(|at| at <= now) {
                worker.kill_at = None;
                if worker.force_kill() {
                    warn!(id = worker.id, slot = worker.slot, "Worker did not exit within grace period, killed");
                }
            }
        }

        if !self.shutting_down {
            let unresponsive_after = self.config.unresponsive_after();
            for worker in self.workers.values_mut() {
                let live = matches!(worker.status, WorkerStatus::Starting | WorkerStatus::Online);
                if !live || worker.last_heartbeat + unresponsive_after > now {
                    continue;
                }
                let silent_ms = now.duration_since(worker.last_heartbeat).as_millis() as u64;
                worker.status = WorkerStatus::Unresponsive;
                let err = SupervisorError::WorkerUnresponsive {
                    id: worker.id,
                    silent_ms,
                };
                error!(slot = worker.slot, "{err}, killing");
                self.events.emit(SupervisionEvent::WorkerUnresponsive {
                    id: worker.id,
                    slot: worker.slot,
                    silent_ms,
                });
                worker.force_kill();
            }

            let due: Vec<usize> = self
                .slots
                .iter_mut()
                .enumerate()
                .filter(|(_, s)| s.restart_at.is_some_and(|at| at <= now))
                .map(|(slot, s)| {
                    s.restart_at = None;
                    slot
                })
                .collect();
            for slot in due {
                if slot < self.desired && self.slots[slot].worker.is_none() {
                    self.fill_slot(slot).await;
                }
            }
        }
    }

    async fn resize(&mut self, workers: usize) -> Result<()> {
        if self.shutting_down {
            return Err(SupervisorError::Validation(
                "cannot resize a pool that is shutting down".to_string(),
            ));
        }
        if workers == 0 || workers > self.config.max_workers {
            return Err(SupervisorError::Validation(format!(
                "pool size must be within 1..={}, got {workers}",
                self.config.max_workers
            )));
        }

        let previous = self.desired;
        self.desired = workers;
        info!(from = previous, to = workers, "Resizing worker pool");

        if workers < previous {
            let grace = self.config.worker_grace_period();
            for worker in self.workers.values_mut().filter(|w| w.slot >= workers) {
                if worker.tx.try_send(SupervisorMessage::Shutdown).is_err() {
                    debug!(id = worker.id, "Shutdown request not delivered");
                }
                worker.status = WorkerStatus::Stopping;
                worker.kill_at = Some(Instant::now() + grace);
            }
            for slot in self.slots.iter_mut().skip(workers) {
                slot.restart_at = None;
            }
            self.trim_slots();
        } else {
            while self.slots.len() < workers {
                self.slots.push(Slot::default());
            }
            for slot in 0..workers {
                let entry = &self.slots[slot];
                if entry.worker.is_none() && entry.restart_at.is_none() {
                    self.fill_slot(slot).await;
                }
            }
        }
        Ok(())
    }

    /// Drop retired slots at the end of the table once they are empty
    fn trim_slots(&mut self) {
        while self.slots.len() > self.desired
            && self.slots.last().is_some_and(|s| s.worker.is_none())
        {
            self.slots.pop();
        }
    }

    fn begin_shutdown(&mut self, deadline: Duration, reply: oneshot::Sender<Result<()>>) {
        if self.shutting_down {
            match &mut self.shutdown {
                Some(pending) => pending.waiters.push(reply),
                None => {
                    let _ = reply.send(Ok(()));
                }
            }
            return;
        }

        self.shutting_down = true;
        for slot in &mut self.slots {
            slot.restart_at = None;
        }

        let now = Instant::now();
        let grace = self.config.worker_grace_period().min(deadline);
        info!(
            workers = self.workers.len(),
            grace_ms = grace.as_millis() as u64,
            deadline_ms = deadline.as_millis() as u64,
            "Shutting down worker pool"
        );

        for worker in self.workers.values_mut() {
            if worker.tx.try_send(SupervisorMessage::Shutdown).is_err() {
                debug!(id = worker.id, "Shutdown request not delivered");
            }
            if worker.status != WorkerStatus::Unresponsive {
                worker.status = WorkerStatus::Stopping;
            }
            worker.kill_at = Some(now + grace);
        }

        self.shutdown = Some(PendingShutdown {
            deadline_at: now + deadline,
            waiters: vec![reply],
        });
        if self.workers.is_empty() {
            self.finish_shutdown(0);
        }
    }

    /// Reply to every shutdown waiter; `remaining` workers still alive
    fn finish_shutdown(&mut self, remaining: usize) {
        self.finished = true;
        self.publish();
        if let Some(pending) = self.shutdown.take() {
            if remaining == 0 {
                info!("Worker pool stopped");
            }
            for waiter in pending.waiters {
                let reply = if remaining == 0 {
                    Ok(())
                } else {
                    Err(SupervisorError::ShutdownTimeout { remaining })
                };
                let _ = waiter.send(reply);
            }
        }
    }

    fn kill_all(&mut self) {
        for worker in self.workers.values_mut() {
            worker.force_kill();
        }
    }

    fn publish(&self) {
        let now = Instant::now();
        let workers = self
            .workers
            .values()
            .map(|w| WorkerSnapshot {
                id: w.id,
                slot: w.slot,
                pid: w.pid,
                status: w.status,
                restart_count: self.slots.get(w.slot).map(|s| s.restarts).unwrap_or(0),
                started_at: w.started_wall,
                uptime_ms: now.duration_since(w.started_at).as_millis() as u64,
                last_metrics: w.metrics,
            })
            .collect::<Vec<_>>();

        let mut workers = workers;
        workers.sort_by_key(|w| (w.slot, w.id));

        self.snapshot_tx.send_replace(PoolSnapshot {
            desired_workers: self.desired,
            shutting_down: self.shutting_down,
            pending_restarts: self.slots.iter().filter(|s| s.restart_at.is_some()).count(),
            workers,
        });
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Forward one worker's messages and its exit into the pool loop
async fn forward(
    id: u64,
    mut rx: mpsc::Receiver<WorkerMessage>,
    mut exit: oneshot::Receiver<WorkerExit>,
    pool_tx: mpsc::UnboundedSender<PoolEvent>,
) {
    let mut open = true;
    loop {
        tokio::select! {
            biased;
            msg = rx.recv(), if open => match msg {
                Some(msg) => {
                    if pool_tx.send(PoolEvent::Message { id, msg }).is_err() {
                        return;
                    }
                }
                None => open = false,
            },
            result = &mut exit => {
                let exit = result.unwrap_or_else(|_| WorkerExit::unknown());
                let _ = pool_tx.send(PoolEvent::Exited { id, exit });
                return;
            }
        }
    }
}

/// Cloneable handle to the pool task
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<PoolSnapshot>,
}

impl SupervisorHandle {
    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until the published snapshot satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> Result<PoolSnapshot>
    where
        F: FnMut(&PoolSnapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| SupervisorError::ChannelClosed("supervisor stopped".to_string()))?;
        Ok(snapshot.clone())
    }

    /// Grow or shrink the pool within `1..=max_workers`
    pub async fn resize(&self, workers: usize) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Resize { workers, reply }).await?;
        rx.await
            .map_err(|_| SupervisorError::ChannelClosed("supervisor stopped".to_string()))?
    }

    /// Force-kill one worker; it is replaced like any other crash
    pub async fn kill_worker(&self, id: u64) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Kill { id, reply }).await?;
        rx.await
            .map_err(|_| SupervisorError::ChannelClosed("supervisor stopped".to_string()))
    }

    /// Ask every worker to drain, kill stragglers after the grace period
    ///
    /// Resolves once all workers are gone, or with `ShutdownTimeout` when
    /// `deadline` elapses first. Calling it again joins the same shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Shutdown { deadline, reply })
            .await
            .is_err()
        {
            // Loop already finished
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

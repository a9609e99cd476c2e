//! Worker Health Channel
//!
//! Asynchronous message protocol between the supervisor and its workers.
//! The protocol is transport-agnostic: in-process workers use an `mpsc` pair
//! directly, OS processes carry the same messages as newline-delimited JSON
//! over their stdin/stdout through [`bridge`].
//!
//! There is no delivery guarantee beyond the transport. A lost or undecodable
//! message is treated exactly like a missed health check.

pub mod worker;

use crate::error::{Result, SupervisorError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use worker::{RequestGuard, WorkerCounters, WorkerRuntime, WorkerRuntimeConfig};

/// Message sent by a worker to the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Worker finished booting and accepts traffic
    Ready,
    /// Reply to a health check
    Health { healthy: bool },
    /// Periodic counters push
    Metrics(WorkerMetrics),
}

/// Message sent by the supervisor to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SupervisorMessage {
    /// Liveness probe; must be answered with `health`
    HealthCheck,
    /// Stop accepting work, drain, terminate
    Shutdown,
}

/// Counters reported by a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub memory_bytes: u64,
    pub request_count: u64,
    pub error_count: u64,
}

/// One side of a worker channel
#[derive(Debug)]
pub struct Endpoint<Out, In> {
    tx: mpsc::Sender<Out>,
    rx: mpsc::Receiver<In>,
}

/// Supervisor side: sends probes and commands, receives worker reports
pub type SupervisorEndpoint = Endpoint<SupervisorMessage, WorkerMessage>;

/// Worker side: sends reports, receives probes and commands
pub type WorkerEndpoint = Endpoint<WorkerMessage, SupervisorMessage>;

impl<Out, In> Endpoint<Out, In> {
    pub fn new(tx: mpsc::Sender<Out>, rx: mpsc::Receiver<In>) -> Self {
        Self { tx, rx }
    }

    /// Send, waiting for buffer space
    pub async fn send(&self, msg: Out) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| SupervisorError::ChannelClosed("peer hung up".to_string()))
    }

    /// Send without waiting; returns false if the message was lost
    pub fn try_send(&self, msg: Out) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Next message, or `None` once the peer hung up
    pub async fn recv(&mut self) -> Option<In> {
        self.rx.recv().await
    }

    pub fn split(self) -> (mpsc::Sender<Out>, mpsc::Receiver<In>) {
        (self.tx, self.rx)
    }
}

/// Build a connected in-memory endpoint pair
pub fn pair(capacity: usize) -> (SupervisorEndpoint, WorkerEndpoint) {
    let (to_worker_tx, to_worker_rx) = mpsc::channel(capacity);
    let (to_supervisor_tx, to_supervisor_rx) = mpsc::channel(capacity);
    (
        Endpoint::new(to_worker_tx, to_supervisor_rx),
        Endpoint::new(to_supervisor_tx, to_worker_rx),
    )
}

/// Encode a message as one JSON line
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Turn an async byte stream pair into an endpoint speaking JSON lines
///
/// Spawns one reader and one writer task. The endpoint reports the peer as
/// gone once the reader hits EOF or an IO error.
pub fn bridge<Out, In, R, W>(reader: R, mut writer: W, capacity: usize) -> Endpoint<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Out>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<In>(capacity);

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let line = match encode_line(&msg) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable channel message");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                debug!(error = %e, "Channel writer closed");
                break;
            }
            if let Err(e) = writer.flush().await {
                debug!(error = %e, "Channel writer flush failed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match decode_line::<In>(&line) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %line, "Dropping undecodable channel line"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Channel reader closed");
                    break;
                }
            }
        }
    });

    Endpoint::new(out_tx, in_rx)
}

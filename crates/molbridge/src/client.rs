//! Client facade - the only surface the rest of a program talks to.
//!
//! ```text
//! caller --send_and_wait--> [pending table] + [outbound queue] --sender--> worker stdin
//! caller <--oneshot reply-- [pending table] <--dispatcher-- worker stdout
//! ```
//!
//! Every request gets a fresh correlation id and its own one-shot slot, so
//! any number of callers can wait concurrently on one worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{CorrelationId, OutboundFrame};
use crate::config::{BridgeConfig, Handshake, WorkerCommand};
use crate::dispatcher::{DispatchExit, FrameReader, run_dispatcher};
use crate::error::BridgeError;
use crate::pending::{PendingGuard, PendingTable};
use crate::sender::run_sender;
use crate::status::BridgeStatus;
use crate::supervisor::{KillSwitch, ProcessState, WorkerProcess};

/// How long to wait for an exit status after the worker closes stdout.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(250);

/// Upward-facing seam so collaborators can be tested against a fake worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Submit one payload and wait for its reply.
    async fn send_and_wait(
        &self,
        payload: String,
        timeout: Duration,
    ) -> Result<String, BridgeError>;

    /// Best-effort liveness.
    fn is_running(&self) -> bool;

    /// Stop the worker and fail everything still pending. Idempotent.
    async fn close(&self);
}

/// State shared with the background tasks.
struct Shared {
    pending: Arc<PendingTable>,
    closed: AtomicBool,
    exit_cause: OnceLock<String>,
    shutdown: CancellationToken,
}

impl Shared {
    /// The worker went away on its own. Fails every pending request once.
    fn worker_gone(&self, cause: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.exit_cause.set(cause).is_err() {
            return;
        }
        let cause = self.exit_cause.get().cloned().unwrap_or_default();
        let failed = self
            .pending
            .fail_all(|| BridgeError::WorkerExited(cause.clone()));
        tracing::error!(%cause, failed, "Worker gone, failing pending requests");
        self.shutdown.cancel();
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed);
        }
        match self.exit_cause.get() {
            Some(cause) => Err(BridgeError::WorkerExited(cause.clone())),
            None => Ok(()),
        }
    }

    /// Error for a caller whose channel to the background tasks broke.
    fn unavailable(&self) -> BridgeError {
        match self.ensure_open() {
            Err(e) => e,
            Ok(()) => BridgeError::Closed,
        }
    }
}

/// A running bridge to one worker process.
pub struct Bridge {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<OutboundFrame>,
    process: Option<WorkerProcess>,
    request_timeout: Duration,
    started_at: DateTime<Utc>,
}

impl Bridge {
    /// Launch the worker, wait out the grace window, and run the handshake if
    /// one is configured.
    pub async fn start(command: WorkerCommand, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let (process, pipes) =
            WorkerProcess::start(config.spawner.as_ref(), &command, config.startup_grace).await?;

        let bridge = Self::assemble(pipes.stdout, pipes.stdin, &config, Some(process));
        if let Some(handshake) = &config.handshake {
            bridge.handshake(handshake).await?;
        }
        Ok(bridge)
    }

    /// Attach to an already-connected worker transport instead of a process.
    pub async fn from_transport<R, W>(
        reader: R,
        writer: W,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let bridge = Self::assemble(reader, writer, &config, None);
        if let Some(handshake) = &config.handshake {
            bridge.handshake(handshake).await?;
        }
        Ok(bridge)
    }

    fn assemble<R, W>(
        reader: R,
        writer: W,
        config: &BridgeConfig,
        process: Option<WorkerProcess>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
            exit_cause: OnceLock::new(),
            shutdown: CancellationToken::new(),
        });

        let (outbound, queue) = mpsc::channel(config.queue_capacity);
        tokio::spawn(run_sender(
            queue,
            FramedWrite::new(writer, JsonLinesCodec::new()),
            Arc::clone(&shared.pending),
            shared.shutdown.clone(),
        ));

        let reader =
            FramedRead::new(reader, JsonLinesCodec::with_max_length(config.max_line_bytes));
        let exit = process
            .as_ref()
            .map(|process| (process.wait_for_exit(), process.kill_switch()));
        tokio::spawn(read_replies(reader, Arc::clone(&shared), exit));

        if let Some(process) = &process {
            let exit = process.wait_for_exit();
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let cause = exit.await;
                shared.worker_gone(cause);
            });
        }

        tracing::info!(
            pid = ?process.as_ref().and_then(WorkerProcess::pid),
            queue_capacity = config.queue_capacity,
            "Bridge ready"
        );

        Self {
            shared,
            outbound,
            process,
            request_timeout: config.request_timeout,
            started_at: Utc::now(),
        }
    }

    async fn handshake(&self, handshake: &Handshake) -> Result<(), BridgeError> {
        tracing::debug!(payload = %handshake.payload, "Sending handshake");
        let outcome = self
            .send_and_wait(handshake.payload.clone(), handshake.timeout)
            .await;

        let failure = match outcome {
            Ok(reply) if reply == handshake.expected => {
                tracing::info!("Worker handshake succeeded");
                return Ok(());
            }
            Ok(reply) => format!(
                "handshake expected {:?}, got {:?}",
                handshake.expected, reply
            ),
            Err(e) => format!("handshake failed: {e}"),
        };

        tracing::error!(%failure, "Worker handshake failed");
        self.close().await;
        Err(BridgeError::Startup(failure))
    }

    /// Submit `payload` and wait up to `timeout` for the matching reply.
    ///
    /// The timeout also covers waiting for room in the outbound queue. On
    /// timeout the pending entry is removed, so a late reply is dropped.
    pub async fn send_and_wait(
        &self,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        self.shared.ensure_open()?;

        let id = CorrelationId::new();
        let (guard, reply) = PendingGuard::register(&self.shared.pending, id.clone());
        // close() or a worker exit may have drained the table just before the insert.
        self.shared.ensure_open()?;

        let frame = OutboundFrame::new(id, payload);
        let mut reply = reply;
        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                sent = self.outbound.send(frame) => {
                    sent.map_err(|_| self.shared.unavailable())?;
                }
                // close() or a worker exit resolves the slot while we wait for queue room.
                early = &mut reply => {
                    return early.map_err(|_| self.shared.unavailable())?;
                }
            }
            reply.await.map_err(|_| self.shared.unavailable())?
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    id = %guard.id(),
                    timeout_ms = timeout.as_millis(),
                    "Request timed out"
                );
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// [`send_and_wait`](Self::send_and_wait) with the configured default timeout.
    pub async fn send(&self, payload: impl Into<String>) -> Result<String, BridgeError> {
        self.send_and_wait(payload, self.request_timeout).await
    }

    /// Serialize a structured request envelope into the payload and send it.
    pub async fn call<T: Serialize + ?Sized>(
        &self,
        request: &T,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let payload = serde_json::to_string(request)?;
        self.send_and_wait(payload, timeout).await
    }

    /// Stop accepting requests, stop the background tasks, kill the worker,
    /// and fail every pending request with `Closed`.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pending = self.shared.pending.len(), "Closing bridge");

        self.shared.shutdown.cancel();
        if let Some(process) = &self.process {
            process.terminate().await;
        }
        let failed = self.shared.pending.fail_all(|| BridgeError::Closed);

        tracing::info!(failed, "Bridge closed");
    }

    pub fn is_running(&self) -> bool {
        self.shared.ensure_open().is_ok()
            && self.process.as_ref().is_none_or(WorkerProcess::is_running)
    }

    pub fn status(&self) -> BridgeStatus {
        let state = match &self.process {
            _ if !self.is_running() => ProcessState::Terminated,
            Some(process) => process.state(),
            None => ProcessState::Running,
        };
        let exit_cause = self
            .shared
            .exit_cause
            .get()
            .cloned()
            .or_else(|| self.process.as_ref().and_then(WorkerProcess::exit_cause));

        BridgeStatus {
            state,
            pid: self.process.as_ref().and_then(WorkerProcess::pid),
            pending: self.shared.pending.len(),
            started_at: self.started_at.to_rfc3339(),
            exit_cause,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // The worker is killed when `process` drops; that exit is not a failure.
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl WorkerClient for Bridge {
    async fn send_and_wait(
        &self,
        payload: String,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        Bridge::send_and_wait(self, payload, timeout).await
    }

    fn is_running(&self) -> bool {
        Bridge::is_running(self)
    }

    async fn close(&self) {
        Bridge::close(self).await
    }
}

/// Run the dispatcher and report an unexpected end of stream as worker exit.
///
/// A worker that closes stdout but keeps running is killed, so it never
/// outlives the bridge that has given up on it.
async fn read_replies<R, F>(
    reader: FrameReader<R>,
    shared: Arc<Shared>,
    exit: Option<(F, KillSwitch)>,
) where
    R: AsyncRead + Unpin,
    F: Future<Output = String>,
{
    let reason = match run_dispatcher(
        reader,
        Arc::clone(&shared.pending),
        shared.shutdown.clone(),
    )
    .await
    {
        DispatchExit::Shutdown => return,
        DispatchExit::EndOfStream => "worker closed stdout".to_string(),
        DispatchExit::ReadFailed(e) => format!("failed to read worker stdout: {e}"),
    };

    // Prefer the real exit status when the process is on its way out.
    match exit {
        Some((exit, kill)) => match tokio::time::timeout(EXIT_STATUS_WAIT, exit).await {
            Ok(cause) => shared.worker_gone(cause),
            Err(_) => {
                shared.worker_gone(reason);
                if !shared.closed.load(Ordering::SeqCst) {
                    tracing::warn!("Worker still running after closing stdout, killing it");
                    kill.kill();
                }
            }
        },
        None => shared.worker_gone(reason),
    }
}

//! Worker process supervisor.
//!
//! A [`Worker`] wraps one application [`SubProcess`] and drives it through
//! its lifecycle inside a dedicated OS process:
//!
//! ```text
//! Unstarted ──make_process()/adopt()──▶ Spawning ──entrance──▶ Running
//!                                                                 │ SIGINT / SIGTERM / shutdown()
//!                                                                 ▼
//!                                         Exited ◀── drain ── Stopping
//! ```
//!
//! While running, a worker owns three tracked tasks: the master heartbeat,
//! the IPC receive loop and the application's `run` hook. Shutdown cancels the
//! running token and waits (bounded) for every tracked task.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::net::UnixDatagram;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{ProtocolError, WorkerId};
use crate::bridge::transport::{Transport, TransportError, bind_worker_socket};
use crate::heartbeat::{Heartbeat, ProcessProbe, SignalProbe};
use crate::pool::PoolDirectory;
use crate::process::{ProcessHandle, WorkerProcess};
use crate::tasks::{DrainReport, TaskSet};

pub const DRAIN_BUDGET: Duration = Duration::from_secs(3);
pub const DRAIN_POLL: Duration = Duration::from_millis(100);
/// Grace period used instead of a drain when the worker opts out of waiting.
pub const NO_WAIT_GRACE: Duration = Duration::from_secs(1);

const DECODE_EXCERPT_LEN: usize = 32;
/// Pause after a failed receive, multiplied by the number of consecutive
/// failures and capped at [`RECEIVE_ERROR_BACKOFF_MAX`].
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const RECEIVE_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("duplicate declaration instance: worker {worker} already has a process")]
    DuplicateSpawn { worker: String },

    #[error("worker {worker} is not attached to a started pool")]
    NotAttached { worker: String },

    #[error("worker {worker} is already attached to a pool")]
    AlreadyAttached { worker: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("ipc unix failed: {} can't read (worker {worker})", path.display())]
    AddressUnavailable { worker: String, path: PathBuf },

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("failed to encode ipc payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("process error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application hooks run inside a worker process.
#[async_trait::async_trait]
pub trait SubProcess: Send + Sync + 'static {
    /// Name used for addressing. Must be unique within a pool.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Main body of the worker. Returning does not stop the worker; an error
    /// is logged and triggers a graceful shutdown.
    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()>;

    /// Called for every IPC message. `from` is the sender's name when known.
    /// Return `false` when the message was not handled.
    async fn on_pipe_message(
        &self,
        ctx: &WorkerContext,
        data: serde_json::Value,
        from: Option<&str>,
    ) -> bool;

    /// Called once shutdown begins, after the running token is cancelled.
    async fn on_exit(&self, _ctx: &WorkerContext) {}

    /// Wait for tracked tasks on shutdown (bounded), or just sleep a second.
    fn wait_for_tasks(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unstarted,
    Spawning,
    Running,
    Stopping,
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

struct Attached {
    directory: Arc<PoolDirectory>,
    transport: Arc<Transport>,
    span: Span,
}

pub struct Worker {
    id: WorkerId,
    name: String,
    subprocess: Arc<dyn SubProcess>,
    state: Mutex<WorkerState>,
    attached: OnceLock<Attached>,
    running: CancellationToken,
    stop_requested: CancellationToken,
    tasks: TaskSet,
    probe: Arc<dyn ProcessProbe>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, name: String, subprocess: Arc<dyn SubProcess>) -> Self {
        Self {
            id,
            name,
            subprocess,
            state: Mutex::new(WorkerState::Unstarted),
            attached: OnceLock::new(),
            running: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            tasks: TaskSet::new(),
            probe: Arc::new(SignalProbe),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle state as seen from the current process.
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running && !self.running.is_cancelled()
    }

    /// Process bound to this worker, if any.
    pub fn process(&self) -> Option<ProcessHandle> {
        self.attached.get()?.directory.process(self.id)
    }

    /// Bind the frozen pool directory. Called once by the pool at start.
    pub(crate) fn attach(
        &self,
        directory: Arc<PoolDirectory>,
        pool_span: &Span,
    ) -> Result<(), WorkerError> {
        let config = directory.config();
        let codec = FrameCodec::with_chunk_size(config.chunk_size)?.with_limits(config.reassembly);
        let span = tracing::info_span!(
            parent: pool_span,
            "worker",
            worker_id = %self.id,
            worker = %self.name
        );
        self.attached
            .set(Attached {
                directory,
                transport: Arc::new(Transport::new(codec)),
                span,
            })
            .map_err(|_| WorkerError::AlreadyAttached {
                worker: self.name.clone(),
            })
    }

    /// Self-owned spawn: describe the process a host should start for us.
    pub fn make_process(&self) -> Result<WorkerProcess, WorkerError> {
        let attached = self.attached()?;
        self.begin_spawn()?;
        Ok(WorkerProcess::new(
            self.id,
            self.name.clone(),
            Arc::clone(&attached.directory),
        ))
    }

    /// Adopted spawn: bind a process created elsewhere (normally the current
    /// one) and run the worker in it until it exits.
    pub async fn adopt(self: &Arc<Self>, handle: ProcessHandle) -> Result<DrainReport, WorkerError> {
        let attached = self.attached()?;
        self.begin_spawn()?;
        attached.directory.bind_process(self.id, handle)?;
        let span = attached.span.clone();
        self.entrance(handle).instrument(span).await
    }

    /// Ask a running worker to stop as if it had received SIGTERM.
    pub fn shutdown(&self) {
        self.stop_requested.cancel();
    }

    pub(crate) fn context(self: &Arc<Self>) -> Result<WorkerContext, WorkerError> {
        let attached = self.attached()?;
        Ok(WorkerContext {
            worker: Arc::clone(self),
            directory: Arc::clone(&attached.directory),
            transport: Arc::clone(&attached.transport),
        })
    }

    fn attached(&self) -> Result<&Attached, WorkerError> {
        self.attached.get().ok_or_else(|| WorkerError::NotAttached {
            worker: self.name.clone(),
        })
    }

    fn begin_spawn(&self) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != WorkerState::Unstarted {
            return Err(WorkerError::DuplicateSpawn {
                worker: self.name.clone(),
            });
        }
        *state = WorkerState::Spawning;
        Ok(())
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = *state;
        tracing::trace!(from = %prev, to = %next, "Worker state change");
        *state = next;
    }

    async fn entrance(self: &Arc<Self>, handle: ProcessHandle) -> Result<DrainReport, WorkerError> {
        let ctx = self.context()?;
        let short_name = self.name.rsplit("::").next().unwrap_or(&self.name);
        set_process_name(&format!("pp:{}#{}", self.id, short_name));
        tracing::info!(pid = handle.pid(), "Sub process running");

        let setup = signal(SignalKind::interrupt()).and_then(|sigint| {
            let sigterm = signal(SignalKind::terminate())?;
            let socket = bind_worker_socket(&ctx.directory.socket_path(self.id))?;
            Ok((sigint, sigterm, socket))
        });
        let (mut sigint, mut sigterm, socket) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                tracing::error!(error = %e, "Sub process failed to start");
                self.set_state(WorkerState::Exited);
                return Err(e.into());
            }
        };
        self.set_state(WorkerState::Running);

        let heartbeat = Heartbeat::new(
            ctx.directory.master_pid(),
            handle.pid(),
            Arc::clone(&self.probe),
        );
        let token = self.running.clone();
        self.tasks.spawn("heartbeat", async move {
            heartbeat.run(token).await;
        });

        let receive_ctx = ctx.clone();
        self.tasks.spawn("ipc-receive", async move {
            receive_loop(receive_ctx, socket).await;
        });

        let subprocess = Arc::clone(&self.subprocess);
        let run_ctx = ctx.clone();
        self.tasks.spawn("worker", async move {
            if let Err(e) = subprocess.run(run_ctx.clone()).await {
                tracing::error!(error = %format!("{e:#}"), "Worker hook failed");
                run_ctx.shutdown();
            }
        });

        let signal = tokio::select! {
            _ = sigint.recv() => Some(Signal::SIGINT),
            _ = sigterm.recv() => Some(Signal::SIGTERM),
            _ = self.stop_requested.cancelled() => None,
        };
        Ok(self.stop(&ctx, signal).await)
    }

    async fn stop(&self, ctx: &WorkerContext, signal: Option<Signal>) -> DrainReport {
        match signal {
            Some(signal) => tracing::info!(%signal, "Received shutdown signal"),
            None => tracing::info!("Shutdown requested"),
        }
        self.set_state(WorkerState::Stopping);
        self.running.cancel();
        self.subprocess.on_exit(ctx).await;

        let report = if self.subprocess.wait_for_tasks() {
            self.tasks.drain(DRAIN_BUDGET, DRAIN_POLL).await
        } else {
            tokio::time::sleep(NO_WAIT_GRACE).await;
            DrainReport::default()
        };

        let path = ctx.directory.socket_path(self.id);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %e, "Socket file already gone");
        }

        self.set_state(WorkerState::Exited);
        tracing::info!(
            finished = report.finished,
            timed_out = report.timed_out.len(),
            "Sub process exited"
        );
        report
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle given to application hooks.
#[derive(Clone)]
pub struct WorkerContext {
    worker: Arc<Worker>,
    directory: Arc<PoolDirectory>,
    transport: Arc<Transport>,
}

impl WorkerContext {
    pub fn worker_id(&self) -> WorkerId {
        self.worker.id
    }

    pub fn name(&self) -> &str {
        &self.worker.name
    }

    pub fn directory(&self) -> &PoolDirectory {
        &self.directory
    }

    pub fn is_running(&self) -> bool {
        !self.worker.running.is_cancelled()
    }

    /// Resolves once the worker starts shutting down.
    pub async fn cancelled(&self) {
        self.worker.running.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.worker.running.clone()
    }

    /// Spawn a task that shutdown waits for.
    #[track_caller]
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.worker.tasks.spawn(name, future);
    }

    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    /// Send `data` to the worker named `destination`.
    ///
    /// Fails immediately when the destination has no bound socket; nothing
    /// is queued for later delivery.
    pub async fn send_message<T>(&self, data: &T, destination: &str) -> Result<(), WorkerError>
    where
        T: Serialize + ?Sized,
    {
        let target = self
            .directory
            .worker_id(destination)
            .ok_or_else(|| WorkerError::UnknownWorker(destination.to_string()))?;
        let payload = serde_json::to_vec(data)?;
        self.send_raw(target, destination, payload.into()).await
    }

    async fn send_raw(
        &self,
        target: WorkerId,
        destination: &str,
        payload: Bytes,
    ) -> Result<(), WorkerError> {
        let path = self.directory.socket_path(target);
        if !path.exists() {
            return Err(WorkerError::AddressUnavailable {
                worker: destination.to_string(),
                path,
            });
        }

        let socket = UnixDatagram::unbound()?;
        socket.connect(&path)?;
        self.transport.send(&socket, self.worker.id, payload).await?;
        tracing::trace!(to = destination, "Sent pipe message");
        Ok(())
    }
}

/// Receive and dispatch messages until the worker stops. Returns the number
/// of failed receives.
async fn receive_loop(ctx: WorkerContext, socket: UnixDatagram) -> u64 {
    let config = ctx.directory.config();
    let timeout = config.receive_timeout;
    let debug = config.debug;
    let token = ctx.worker.running.clone();
    let mut errors = 0u64;
    let mut consecutive = 0u32;

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = ctx.transport.receive(&socket, timeout) => received,
        };
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                consecutive = 0;
                continue;
            }
            Err(e) => {
                errors += 1;
                consecutive = consecutive.saturating_add(1);
                let backoff = receive_error_backoff(consecutive);
                tracing::error!(
                    error = %e,
                    consecutive,
                    backoff_ms = backoff.as_millis() as u64,
                    "Ipc message error"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };
        consecutive = 0;

        let from = ctx.directory.name(message.source);
        let data = match serde_json::from_slice::<serde_json::Value>(&message.payload) {
            Ok(data) => data,
            Err(e) => {
                if debug {
                    let (offset, excerpt) = decode_excerpt(&message.payload, &e);
                    tracing::error!(
                        source = %message.source,
                        error = %e,
                        offset,
                        len = message.payload.len(),
                        excerpt = %String::from_utf8_lossy(excerpt),
                        "Ipc message decode failure"
                    );
                } else {
                    tracing::error!(source = %message.source, error = %e, "Ipc message decode failure");
                }
                continue;
            }
        };

        if !ctx.worker.subprocess.on_pipe_message(&ctx, data, from).await {
            tracing::debug!(source = %message.source, "Pipe message not handled");
        }
    }
    tracing::debug!(errors, "Receive loop stopped");
    errors
}

fn receive_error_backoff(consecutive: u32) -> Duration {
    RECEIVE_ERROR_BACKOFF
        .saturating_mul(consecutive)
        .min(RECEIVE_ERROR_BACKOFF_MAX)
}

/// Byte offset of a decode error and up to 32 bytes of payload around it.
fn decode_excerpt<'a>(payload: &'a [u8], err: &serde_json::Error) -> (usize, &'a [u8]) {
    let offset = error_offset(payload, err.line(), err.column());
    let start = offset.saturating_sub(DECODE_EXCERPT_LEN / 2);
    let end = (start + DECODE_EXCERPT_LEN).min(payload.len());
    (offset, &payload[start..end])
}

fn error_offset(payload: &[u8], line: usize, column: usize) -> usize {
    if line == 0 {
        return payload.len();
    }
    let mut offset = 0;
    for (i, text) in payload.split(|b| *b == b'\n').enumerate() {
        if i + 1 == line {
            return (offset + column.saturating_sub(1)).min(payload.len());
        }
        offset += text.len() + 1;
    }
    payload.len()
}

#[cfg(target_os = "linux")]
fn set_process_name(name: &str) {
    match std::ffi::CString::new(name) {
        Ok(name) => {
            if let Err(e) = nix::sys::prctl::set_name(&name) {
                tracing::debug!(error = %e, "Failed to set process name");
            }
        }
        Err(e) => tracing::debug!(error = %e, "Invalid process name"),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_name(_name: &str) {}

//! OS processes backing pool workers.
//!
//! Workers never fork a live runtime. The master re-executes its own binary
//! with `PROCPOOL_*` variables naming the worker to run; the child registers
//! the same workers and its drive recognises the child role from those
//! variables.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::WorkerId;
use crate::bridge::transport::SocketDir;
use crate::pool::PoolDirectory;
use crate::worker::WorkerError;

pub const ENV_WORKER_ID: &str = "PROCPOOL_WORKER_ID";
pub const ENV_MASTER_PID: &str = "PROCPOOL_MASTER_PID";
pub const ENV_SOCKET_DIR: &str = "PROCPOOL_SOCKET_DIR";
pub const ENV_CHUNK_SIZE: &str = "PROCPOOL_CHUNK_SIZE";

/// Worker id this process was spawned to run, if it is a pool child.
pub fn child_worker_id() -> Option<u32> {
    parse_env_u32(ENV_WORKER_ID)
}

/// Master pid handed down by the spawning process.
pub fn master_pid_from_env() -> Option<u32> {
    parse_env_u32(ENV_MASTER_PID)
}

fn parse_env_u32(key: &str) -> Option<u32> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring malformed process variable");
            None
        }
    }
}

/// Pid of a live (or once live) worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn current() -> Self {
        Self::new(std::process::id())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Signal-0 probe.
    pub fn is_alive(&self) -> bool {
        signal::kill(self.nix_pid(), None).is_ok()
    }

    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        signal::kill(self.nix_pid(), signal)
    }

    fn nix_pid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}

/// Why a worker process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
    /// SIGKILL, most often the OOM killer.
    Killed,
    Unknown,
}

impl TerminationReason {
    pub fn from_status(status: &ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        match status.signal().map(Signal::try_from) {
            Some(Ok(Signal::SIGKILL)) => Self::Killed,
            Some(Ok(sig)) => Self::Signaled(sig),
            _ => Self::Unknown,
        }
    }

    /// Clean exits, including the graceful SIGTERM/SIGINT path.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            Self::Exited(0) | Self::Signaled(Signal::SIGTERM) | Self::Signaled(Signal::SIGINT)
        )
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig),
            Self::Killed => f.write_str("killed by SIGKILL (possibly out of memory)"),
            Self::Unknown => f.write_str("unknown reason"),
        }
    }
}

/// Command that re-executes the current binary as worker `index`.
pub(crate) fn reexec_command(index: u32, env: &[(&'static str, String)]) -> io::Result<Command> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.args(std::env::args_os().skip(1))
        .env(ENV_WORKER_ID, index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    for (key, value) in env {
        cmd.env(key, value);
    }
    Ok(cmd)
}

/// Variables every child of `directory`'s pool needs.
pub(crate) fn child_env(directory: &PoolDirectory) -> Vec<(&'static str, String)> {
    vec![
        (ENV_MASTER_PID, directory.master_pid().to_string()),
        (
            ENV_SOCKET_DIR,
            directory.socket_base().to_string_lossy().into_owned(),
        ),
        (ENV_CHUNK_SIZE, directory.config().chunk_size.to_string()),
    ]
}

/// A worker's self-owned process, ready to be spawned by a host.
///
/// Holds a share of the pool's socket directory: the directory stays on disk
/// until every queued process has been dropped.
pub struct WorkerProcess {
    worker_id: WorkerId,
    name: String,
    directory: Arc<PoolDirectory>,
    socket_dir: Option<Arc<SocketDir>>,
}

impl WorkerProcess {
    pub(crate) fn new(worker_id: WorkerId, name: String, directory: Arc<PoolDirectory>) -> Self {
        Self {
            worker_id,
            name,
            directory,
            socket_dir: None,
        }
    }

    pub(crate) fn with_socket_dir(mut self, socket_dir: Arc<SocketDir>) -> Self {
        self.socket_dir = Some(socket_dir);
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> io::Result<Command> {
        reexec_command(self.worker_id.get(), &child_env(&self.directory))
    }

    /// Start the child and bind its pid to the worker.
    pub fn spawn(&self) -> Result<Child, WorkerError> {
        let child = self.command()?.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned worker has no pid"))?;
        self.directory
            .bind_process(self.worker_id, ProcessHandle::new(pid))?;
        tracing::info!(
            worker_id = %self.worker_id,
            worker = %self.name,
            pid,
            "Spawned worker process"
        );
        Ok(child)
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("worker_id", &self.worker_id)
            .field("name", &self.name)
            .finish()
    }
}

/// A child being supervised by the master.
pub(crate) struct SpawnedChild {
    pub index: usize,
    pub label: String,
    pub child: Child,
}

/// Wait for every child to exit. The first time `shutdown` fires, SIGTERM is
/// forwarded to all children. `on_exit` sees each child's index as it is
/// reaped. Children are never restarted.
pub(crate) async fn supervise(
    children: Vec<SpawnedChild>,
    shutdown: CancellationToken,
    mut on_exit: impl FnMut(usize),
) {
    let handles: Vec<ProcessHandle> = children
        .iter()
        .filter_map(|c| c.child.id().map(ProcessHandle::new))
        .collect();

    let mut waits: FuturesUnordered<_> = children
        .into_iter()
        .map(|mut c| async move {
            let status = c.child.wait().await;
            (c.index, c.label, status)
        })
        .collect();

    let mut forwarded = false;
    loop {
        tokio::select! {
            exit = waits.next() => {
                let Some((index, label, status)) = exit else { break };
                match status {
                    Ok(status) => {
                        let reason = TerminationReason::from_status(&status);
                        if reason.is_graceful() {
                            tracing::info!(index, worker = %label, %reason, "Worker process exited");
                        } else {
                            tracing::warn!(index, worker = %label, %reason, "Worker process exited");
                        }
                    }
                    Err(e) => {
                        tracing::error!(index, worker = %label, error = %e, "Failed to wait for worker process");
                    }
                }
                on_exit(index);
            }
            _ = shutdown.cancelled(), if !forwarded => {
                forwarded = true;
                tracing::info!(children = handles.len(), "Forwarding SIGTERM to worker processes");
                for handle in &handles {
                    if let Err(e) = handle.signal(Signal::SIGTERM) {
                        tracing::debug!(pid = handle.pid(), error = %e, "Worker already gone");
                    }
                }
            }
        }
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM delivered to this process.
pub(crate) fn cancel_on_signal(token: CancellationToken) -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = token.cancelled() => return,
        };
        tracing::info!(signal = name, "Master received shutdown signal");
        token.cancel();
    });
    Ok(())
}

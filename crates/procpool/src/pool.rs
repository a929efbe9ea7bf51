//! Process pool: worker registry and entry point.
//!
//! Workers are registered with [`ProcessPool::add`] and receive sequential
//! ids. [`ProcessPool::start`] freezes the registry into a shared
//! [`PoolDirectory`] and hands the workers to the selected [`PoolDrive`].
//!
//! The same binary runs as master and as every worker: a re-executed child
//! registers the same workers in the same order, so ids line up, and
//! `start()` then runs only that child's worker.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tracing::{Instrument, Span};

use crate::bridge::protocol::{ProtocolError, WorkerId};
use crate::bridge::transport::{socket_dir, worker_socket_path};
use crate::config::PoolConfig;
use crate::drive::direct::{DirectDrive, ProcessHost};
use crate::drive::native::NativePoolDrive;
use crate::drive::{PoolDrive, PoolRole, PoolStartHook};
use crate::process::{self, ProcessHandle};
use crate::worker::{SubProcess, Worker, WorkerError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool already started, workers can no longer be added")]
    AlreadyStarted,

    #[error("duplicate worker name: {0}")]
    DuplicateName(String),

    #[error("pool has no workers")]
    NoWorkers,

    #[error("unknown worker id: {0}")]
    UnknownWorker(WorkerId),

    #[error("process error: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("invalid pool configuration: {0}")]
    Config(#[from] ProtocolError),
}

/// Read-only view of a started pool, shared by workers and drives.
///
/// Names and ids never change after start. Each worker has one process slot
/// that is written exactly once, when its process is spawned or adopted.
#[derive(Debug)]
pub struct PoolDirectory {
    config: PoolConfig,
    master_pid: u32,
    socket_dir: PathBuf,
    names: Vec<String>,
    ids: HashMap<String, WorkerId>,
    processes: Vec<OnceLock<ProcessHandle>>,
}

impl PoolDirectory {
    pub(crate) fn new(config: PoolConfig, master_pid: u32) -> Self {
        let socket_dir = socket_dir(&config.socket_dir, master_pid);
        Self {
            config,
            master_pid,
            socket_dir,
            names: Vec::new(),
            ids: HashMap::new(),
            processes: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, name: &str) -> Result<WorkerId, PoolError> {
        if self.ids.contains_key(name) {
            return Err(PoolError::DuplicateName(name.to_string()));
        }
        let id = WorkerId::new(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        self.processes.push(OnceLock::new());
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn worker_id(&self, name: &str) -> Option<WorkerId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: WorkerId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn socket_path(&self, id: WorkerId) -> PathBuf {
        worker_socket_path(&self.socket_dir, id)
    }

    /// Socket path of the worker named `name`.
    pub fn transport_address(&self, name: &str) -> Option<PathBuf> {
        self.worker_id(name).map(|id| self.socket_path(id))
    }

    pub fn process(&self, id: WorkerId) -> Option<ProcessHandle> {
        self.processes.get(id.index())?.get().copied()
    }

    pub(crate) fn bind_process(&self, id: WorkerId, handle: ProcessHandle) -> Result<(), WorkerError> {
        let slot = self
            .processes
            .get(id.index())
            .ok_or_else(|| WorkerError::UnknownWorker(id.to_string()))?;
        slot.set(handle).map_err(|_| WorkerError::DuplicateSpawn {
            worker: self.name(id).unwrap_or_default().to_string(),
        })
    }

    pub fn master_pid(&self) -> u32 {
        self.master_pid
    }

    /// Directory holding this pool's worker sockets.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Base directory the socket directory is created in.
    pub fn socket_base(&self) -> &Path {
        &self.config.socket_dir
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

pub struct ProcessPool {
    directory: Arc<PoolDirectory>,
    workers: Vec<Arc<Worker>>,
    drive: Box<dyn PoolDrive>,
    span: Span,
    start_hook: Option<PoolStartHook>,
    started: bool,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, drive: impl PoolDrive + 'static) -> Self {
        let master_pid = match process::child_worker_id() {
            Some(_) => process::master_pid_from_env().unwrap_or_else(std::process::id),
            None => std::process::id(),
        };
        Self {
            directory: Arc::new(PoolDirectory::new(config, master_pid)),
            workers: Vec::new(),
            drive: Box::new(drive),
            span: tracing::info_span!("pool", master_pid),
            start_hook: None,
            started: false,
        }
    }

    /// Pool whose processes are started by an existing process table.
    pub fn direct(config: PoolConfig, host: Arc<dyn ProcessHost>) -> Self {
        Self::new(config, DirectDrive::new(host))
    }

    /// Standalone pool that spawns and supervises its own processes.
    pub fn native(config: PoolConfig) -> Self {
        Self::new(config, NativePoolDrive::new())
    }

    /// Span every pool, drive and worker event is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run `hook` as a concurrent task in the master once the pool starts.
    pub fn on_pool_start<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce(Arc<PoolDirectory>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start_hook = Some(Box::new(move |directory| hook(directory).boxed()));
    }

    pub fn add<S: SubProcess>(&mut self, subprocess: S) -> Result<WorkerId, PoolError> {
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        let directory = Arc::get_mut(&mut self.directory).ok_or(PoolError::AlreadyStarted)?;
        let name = subprocess.name();
        let id = directory.register(&name)?;
        tracing::debug!(worker_id = %id, worker = %name, "Registered worker");
        self.workers
            .push(Arc::new(Worker::new(id, name, Arc::new(subprocess))));
        Ok(id)
    }

    /// Id of the worker named `name`; `None` when no such worker exists.
    pub fn worker_id(&self, name: &str) -> Option<WorkerId> {
        self.directory.worker_id(name)
    }

    pub fn name(&self, id: WorkerId) -> Option<&str> {
        self.directory.name(id)
    }

    pub fn process(&self, id: WorkerId) -> Option<ProcessHandle> {
        self.drive.process(id)
    }

    pub fn transport_address(&self, name: &str) -> Option<PathBuf> {
        self.directory.transport_address(name)
    }

    pub fn master_pid(&self) -> u32 {
        self.directory.master_pid()
    }

    pub fn directory(&self) -> &PoolDirectory {
        &self.directory
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Arc<Worker>> {
        self.workers.get(id.index())
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Freeze the registry and hand the workers to the drive.
    ///
    /// In the master this returns [`PoolRole::Master`] once the drive has
    /// launched (or, for the native drive, reaped) the worker processes. In a
    /// worker process it returns [`PoolRole::Worker`] after the worker exits.
    pub async fn start(&mut self) -> Result<PoolRole, PoolError> {
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        if self.workers.is_empty() {
            return Err(PoolError::NoWorkers);
        }
        self.directory.config().validate()?;
        self.started = true;

        for worker in &self.workers {
            worker.attach(Arc::clone(&self.directory), &self.span)?;
        }
        self.drive.set_span(self.span.clone());
        self.drive
            .set_workers(Arc::clone(&self.directory), self.workers.clone());
        if let Some(hook) = self.start_hook.take() {
            self.drive.on_pool_start(hook);
        }

        let span = self.span.clone();
        async {
            tracing::info!(
                workers = self.workers.len(),
                socket_dir = %self.directory.socket_dir().display(),
                "Starting process pool"
            );
            self.drive.start().await
        }
        .instrument(span)
        .await
    }

    /// Start the pool; in a worker process, exit once the worker has stopped.
    pub async fn serve(mut self) -> Result<(), PoolError> {
        match self.start().await? {
            PoolRole::Master => Ok(()),
            PoolRole::Worker(id) => {
                tracing::info!(worker_id = %id, "Worker process exiting");
                std::process::exit(0)
            }
        }
    }
}

//! Direct drive: worker processes are started by a host's process table.
//!
//! In the master, each worker describes its own process
//! ([`Worker::make_process`]) and the host decides when to launch it. In a
//! re-executed child, the drive runs that child's worker in-process.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::{PoolDrive, PoolRole, PoolStartHook, worker_for};
use crate::bridge::protocol::WorkerId;
use crate::bridge::transport::SocketDir;
use crate::pool::{PoolDirectory, PoolError};
use crate::process::{self, ProcessHandle, SpawnedChild, WorkerProcess, supervise};
use crate::worker::Worker;

/// A process table that accepts worker processes.
pub trait ProcessHost: Send + Sync {
    fn add_process(&self, process: WorkerProcess) -> Result<(), PoolError>;
}

/// Process table bundled with the crate.
///
/// Collects processes while the pool starts; [`ProcessTable::run`] launches
/// them and supervises them until they exit.
#[derive(Default)]
pub struct ProcessTable {
    pending: Mutex<Vec<WorkerProcess>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Spawn every queued process and wait for all of them to exit.
    /// SIGTERM is forwarded to the children when `shutdown` fires.
    ///
    /// The processes, and with them the socket directory, are kept until the
    /// last child has been reaped.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PoolError> {
        let processes = std::mem::take(&mut *self.lock());
        let mut children = Vec::with_capacity(processes.len());

        for process in &processes {
            match process.spawn() {
                Ok(child) => children.push(SpawnedChild {
                    index: process.worker_id().get() as usize,
                    label: process.name().to_string(),
                    child,
                }),
                Err(e) => {
                    tracing::error!(worker = %process.name(), error = %e, "Failed to spawn worker");
                    for spawned in &mut children {
                        let _ = spawned.child.start_kill();
                    }
                    return Err(e.into());
                }
            }
        }

        supervise(children, shutdown, |_| {}).await;
        drop(processes);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WorkerProcess>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessHost for ProcessTable {
    fn add_process(&self, process: WorkerProcess) -> Result<(), PoolError> {
        tracing::debug!(worker_id = %process.worker_id(), worker = %process.name(), "Queued worker process");
        self.lock().push(process);
        Ok(())
    }
}

pub struct DirectDrive {
    host: Arc<dyn ProcessHost>,
    child: Option<u32>,
    span: Span,
    directory: Option<Arc<PoolDirectory>>,
    workers: Vec<Arc<Worker>>,
    start_hook: Option<PoolStartHook>,
    socket_dir: Option<Arc<SocketDir>>,
}

impl DirectDrive {
    pub fn new(host: Arc<dyn ProcessHost>) -> Self {
        Self {
            host,
            child: process::child_worker_id(),
            span: Span::none(),
            directory: None,
            workers: Vec::new(),
            start_hook: None,
            socket_dir: None,
        }
    }

    /// Override the child role detected from the environment.
    pub fn with_child(mut self, worker_index: Option<u32>) -> Self {
        self.child = worker_index;
        self
    }
}

#[async_trait::async_trait]
impl PoolDrive for DirectDrive {
    fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    fn set_workers(&mut self, directory: Arc<PoolDirectory>, workers: Vec<Arc<Worker>>) {
        self.directory = Some(directory);
        self.workers = workers;
    }

    fn on_pool_start(&mut self, hook: PoolStartHook) {
        self.start_hook = Some(hook);
    }

    fn process(&self, worker_id: WorkerId) -> Option<ProcessHandle> {
        self.directory.as_ref()?.process(worker_id)
    }

    async fn start(&mut self) -> Result<PoolRole, PoolError> {
        let directory = self.directory.clone().ok_or(PoolError::NoWorkers)?;

        if let Some(index) = self.child {
            let worker = worker_for(&self.workers, index)?;
            tracing::debug!(worker_id = %worker.id(), "Running spawned worker");
            worker.adopt(ProcessHandle::current()).await?;
            return Ok(PoolRole::Worker(worker.id()));
        }

        // Every queued process shares the guard, so the directory outlives
        // this drive for as long as the host keeps the processes.
        let socket_dir = Arc::new(SocketDir::create(directory.socket_dir().to_path_buf())?);
        self.socket_dir = Some(Arc::clone(&socket_dir));

        if let Some(hook) = self.start_hook.take() {
            tokio::spawn(hook(Arc::clone(&directory)).instrument(self.span.clone()));
        }

        for worker in &self.workers {
            let process = worker.make_process()?.with_socket_dir(Arc::clone(&socket_dir));
            self.host.add_process(process)?;
        }
        tracing::info!(workers = self.workers.len(), "Worker processes handed to host");
        Ok(PoolRole::Master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::ProcessPool;
    use crate::worker::{SubProcess, WorkerContext, WorkerState};

    struct Quick(&'static str);

    #[async_trait::async_trait]
    impl SubProcess for Quick {
        fn name(&self) -> String {
            self.0.to_string()
        }

        async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
            ctx.shutdown();
            Ok(())
        }

        async fn on_pipe_message(
            &self,
            _: &WorkerContext,
            _: serde_json::Value,
            _: Option<&str>,
        ) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn process_table_queues_processes() {
        let tmp = tempfile::tempdir().unwrap();
        let table = Arc::new(ProcessTable::new());
        let drive = DirectDrive::new(table.clone()).with_child(None);
        let mut pool = ProcessPool::new(PoolConfig::new().with_socket_dir(tmp.path()), drive);
        pool.add(Quick("a")).unwrap();
        pool.add(Quick("b")).unwrap();

        assert!(table.is_empty());
        assert_eq!(pool.start().await.unwrap(), PoolRole::Master);
        assert_eq!(table.len(), 2);

        // Already spawning: a second process for the same worker is refused.
        let worker = pool.worker(WorkerId::new(0)).unwrap();
        assert!(worker.make_process().is_err());
    }

    #[tokio::test]
    async fn socket_dir_outlives_served_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let table = Arc::new(ProcessTable::new());
        let drive = DirectDrive::new(table.clone()).with_child(None);
        let mut pool = ProcessPool::new(PoolConfig::new().with_socket_dir(tmp.path()), drive);
        pool.add(Quick("a")).unwrap();
        let dir = crate::bridge::transport::socket_dir(tmp.path(), std::process::id());

        pool.serve().await.unwrap();

        assert_eq!(table.len(), 1);
        assert!(dir.is_dir());

        // Removed once the host lets go of the queued processes.
        drop(table);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn empty_process_table_runs_to_completion() {
        ProcessTable::new()
            .run(CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn child_role_runs_matching_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let table = Arc::new(ProcessTable::new());
        let drive = DirectDrive::new(table.clone()).with_child(Some(1));
        let mut pool = ProcessPool::new(PoolConfig::new().with_socket_dir(tmp.path()), drive);
        pool.add(Quick("a")).unwrap();
        pool.add(Quick("b")).unwrap();

        let role = pool.start().await.unwrap();

        assert_eq!(role, PoolRole::Worker(WorkerId::new(1)));
        assert!(table.is_empty());
        assert_eq!(
            pool.process(WorkerId::new(1)),
            Some(ProcessHandle::current())
        );
        assert_eq!(pool.process(WorkerId::new(0)), None);
        assert_eq!(pool.workers()[0].state(), WorkerState::Unstarted);
        assert_eq!(pool.workers()[1].state(), WorkerState::Exited);
    }

    #[tokio::test]
    async fn child_role_with_unknown_index_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let drive = DirectDrive::new(Arc::new(ProcessTable::new())).with_child(Some(9));
        let mut pool = ProcessPool::new(PoolConfig::new().with_socket_dir(tmp.path()), drive);
        pool.add(Quick("a")).unwrap();

        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownWorker(id) if id == WorkerId::new(9)));
    }
}

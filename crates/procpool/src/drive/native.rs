//! Native process pool.
//!
//! [`NativePool`] is a small fixed-size process pool: the manager spawns one
//! child per index (by re-executing the current binary), fires `start`,
//! forwards SIGINT/SIGTERM to its children and waits for them. A child fires
//! `worker_start` with its own index and handle.
//!
//! [`NativePoolDrive`] maps pool indexes onto worker ids. Each child adopts
//! its own process for the matching worker. Worker shutdown is driven only
//! by the worker's signal handling: `worker_stop` fires in the manager when a
//! child has already been reaped, so the drive can only log it.

use std::future::Future;
use std::io;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::{PoolDrive, PoolRole, PoolStartHook, worker_for};
use crate::bridge::protocol::WorkerId;
use crate::bridge::transport::SocketDir;
use crate::pool::{PoolDirectory, PoolError};
use crate::process::{self, ProcessHandle, SpawnedChild, supervise};
use crate::worker::Worker;

type StartCallback = Box<dyn FnOnce(&[ProcessHandle]) + Send>;
type WorkerStartCallback =
    Box<dyn FnOnce(usize, ProcessHandle) -> BoxFuture<'static, Result<(), PoolError>> + Send>;
type WorkerStopCallback = Box<dyn FnMut(usize) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeRole {
    Manager,
    Worker(usize),
}

impl NativeRole {
    pub fn from_env() -> Self {
        match process::child_worker_id() {
            Some(index) => Self::Worker(index as usize),
            None => Self::Manager,
        }
    }
}

pub struct NativePool {
    size: usize,
    role: NativeRole,
    env: Vec<(&'static str, String)>,
    processes: Vec<Option<ProcessHandle>>,
    on_start: Option<StartCallback>,
    on_worker_start: Option<WorkerStartCallback>,
    on_worker_stop: Option<WorkerStopCallback>,
}

impl NativePool {
    pub fn new(size: usize) -> Self {
        Self::with_role(size, NativeRole::from_env())
    }

    pub fn with_role(size: usize, role: NativeRole) -> Self {
        Self {
            size,
            role,
            env: Vec::new(),
            processes: vec![None; size],
            on_start: None,
            on_worker_start: None,
            on_worker_stop: None,
        }
    }

    /// Extra variable set on every spawned child.
    pub fn with_env(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.env.push((key, value.into()));
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn role(&self) -> NativeRole {
        self.role
    }

    /// Manager only: fired once every child has been spawned.
    pub fn on_start(&mut self, callback: impl FnOnce(&[ProcessHandle]) + Send + 'static) {
        self.on_start = Some(Box::new(callback));
    }

    /// Child only: fired with the child's index and its own handle.
    pub fn on_worker_start<F, Fut>(&mut self, callback: F)
    where
        F: FnOnce(usize, ProcessHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PoolError>> + Send + 'static,
    {
        self.on_worker_start = Some(Box::new(move |index, handle| {
            callback(index, handle).boxed()
        }));
    }

    /// Manager only: fired after the child at an index has been reaped.
    pub fn on_worker_stop(&mut self, callback: impl FnMut(usize) + Send + 'static) {
        self.on_worker_stop = Some(Box::new(callback));
    }

    pub fn process(&self, index: usize) -> Option<ProcessHandle> {
        self.processes.get(index).copied().flatten()
    }

    /// Run this process's side of the pool to completion.
    pub async fn start(&mut self) -> Result<NativeRole, PoolError> {
        match self.role {
            NativeRole::Worker(index) => {
                if index >= self.size {
                    return Err(PoolError::UnknownWorker(WorkerId::new(index as u32)));
                }
                let handle = ProcessHandle::current();
                self.processes[index] = Some(handle);
                if let Some(callback) = self.on_worker_start.take() {
                    callback(index, handle).await?;
                }
                Ok(NativeRole::Worker(index))
            }
            NativeRole::Manager => {
                let shutdown = CancellationToken::new();
                process::cancel_on_signal(shutdown.clone())?;

                let children = self.spawn_children()?;
                let handles: Vec<ProcessHandle> = self.processes.iter().flatten().copied().collect();
                tracing::info!(size = self.size, "Native pool started");
                if let Some(callback) = self.on_start.take() {
                    callback(&handles);
                }

                let mut on_stop = self.on_worker_stop.take();
                supervise(children, shutdown.clone(), |index| {
                    if let Some(callback) = on_stop.as_mut() {
                        callback(index);
                    }
                })
                .await;
                shutdown.cancel();
                tracing::info!("Native pool stopped");
                Ok(NativeRole::Manager)
            }
        }
    }

    fn spawn_children(&mut self) -> Result<Vec<SpawnedChild>, PoolError> {
        let mut children: Vec<SpawnedChild> = Vec::with_capacity(self.size);
        for index in 0..self.size {
            let spawned = process::reexec_command(index as u32, &self.env)
                .and_then(|mut cmd| cmd.spawn())
                .and_then(|child| {
                    let pid = child
                        .id()
                        .ok_or_else(|| io::Error::other("spawned child has no pid"))?;
                    Ok((child, pid))
                });
            match spawned {
                Ok((child, pid)) => {
                    tracing::debug!(index, pid, "Spawned pool child");
                    self.processes[index] = Some(ProcessHandle::new(pid));
                    children.push(SpawnedChild {
                        index,
                        label: format!("#{index}"),
                        child,
                    });
                }
                Err(e) => {
                    tracing::error!(index, error = %e, "Failed to spawn pool child");
                    for spawned in &mut children {
                        let _ = spawned.child.start_kill();
                    }
                    return Err(PoolError::Spawn(e));
                }
            }
        }
        Ok(children)
    }
}

pub struct NativePoolDrive {
    role: NativeRole,
    span: Span,
    directory: Option<Arc<PoolDirectory>>,
    workers: Vec<Arc<Worker>>,
    start_hook: Option<PoolStartHook>,
    socket_dir: Option<SocketDir>,
}

impl Default for NativePoolDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl NativePoolDrive {
    pub fn new() -> Self {
        Self {
            role: NativeRole::from_env(),
            span: Span::none(),
            directory: None,
            workers: Vec::new(),
            start_hook: None,
            socket_dir: None,
        }
    }

    /// Override the role detected from the environment.
    pub fn with_role(mut self, role: NativeRole) -> Self {
        self.role = role;
        self
    }
}

#[async_trait::async_trait]
impl PoolDrive for NativePoolDrive {
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

        let mut pool = process::child_env(&directory).into_iter().fold(
            NativePool::with_role(self.workers.len(), self.role),
            |pool, (key, value)| pool.with_env(key, value),
        );

        if pool.role() == NativeRole::Manager {
            self.socket_dir = Some(SocketDir::create(directory.socket_dir().to_path_buf())?);
        }

        let hook = self.start_hook.take();
        let span = self.span.clone();
        let start_directory = Arc::clone(&directory);
        pool.on_start(move |handles| {
            for (index, handle) in handles.iter().enumerate() {
                if let Err(e) = start_directory.bind_process(WorkerId::new(index as u32), *handle) {
                    tracing::warn!(index, error = %e, "Failed to record worker process");
                }
            }
            if let Some(hook) = hook {
                tokio::spawn(hook(start_directory).instrument(span));
            }
        });

        let workers = self.workers.clone();
        pool.on_worker_start(move |index, handle| async move {
            let worker = worker_for(&workers, index as u32)?;
            worker.adopt(handle).await?;
            Ok(())
        });

        let stop_directory = Arc::clone(&directory);
        pool.on_worker_stop(move |index| {
            let id = WorkerId::new(index as u32);
            tracing::debug!(
                worker_id = %id,
                worker = stop_directory.name(id).unwrap_or_default(),
                "Worker stopped in its own process"
            );
        });

        match pool.start().await? {
            NativeRole::Manager => Ok(PoolRole::Master),
            NativeRole::Worker(index) => Ok(PoolRole::Worker(WorkerId::new(index as u32))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::ProcessPool;
    use crate::worker::{SubProcess, WorkerContext, WorkerState};
    use std::sync::atomic::{AtomicBool, Ordering};

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
    async fn child_adopts_its_own_process() {
        let tmp = tempfile::tempdir().unwrap();
        let drive = NativePoolDrive::new().with_role(NativeRole::Worker(1));
        let mut pool = ProcessPool::new(PoolConfig::new().with_socket_dir(tmp.path()), drive);
        pool.add(Quick("a")).unwrap();
        pool.add(Quick("b")).unwrap();

        let hook_ran = Arc::new(AtomicBool::new(false));
        let flag = hook_ran.clone();
        pool.on_pool_start(move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });

        let role = pool.start().await.unwrap();

        assert_eq!(role, PoolRole::Worker(WorkerId::new(1)));
        assert_eq!(
            pool.process(WorkerId::new(1)),
            Some(ProcessHandle::current())
        );
        assert_eq!(pool.process(WorkerId::new(0)), None);
        assert_eq!(pool.workers()[0].state(), WorkerState::Unstarted);
        assert_eq!(pool.workers()[1].state(), WorkerState::Exited);
        assert!(!hook_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn primitive_child_fires_worker_start_only() {
        let mut pool = NativePool::with_role(3, NativeRole::Worker(2));
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.on_start(|_| panic!("start fires in the manager only"));
        pool.on_worker_start(move |index, handle| async move {
            let _ = tx.send((index, handle));
            Ok(())
        });

        assert_eq!(pool.start().await.unwrap(), NativeRole::Worker(2));
        assert_eq!(rx.await.unwrap(), (2, ProcessHandle::current()));
        assert_eq!(pool.process(2), Some(ProcessHandle::current()));
        assert_eq!(pool.process(0), None);
    }

    #[tokio::test]
    async fn primitive_child_index_out_of_range() {
        let mut pool = NativePool::with_role(1, NativeRole::Worker(4));
        assert!(matches!(
            pool.start().await,
            Err(PoolError::UnknownWorker(id)) if id == WorkerId::new(4)
        ));
    }
}

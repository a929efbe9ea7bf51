//! Strategies for turning registered workers into running processes.
//!
//! - [`direct::DirectDrive`]: hands self-owned worker processes to an
//!   existing process table.
//! - [`native::NativePoolDrive`]: a standalone fixed-size pool whose
//!   children adopt their worker.

pub mod direct;
pub mod native;

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::Span;

use crate::bridge::protocol::WorkerId;
use crate::pool::{PoolDirectory, PoolError};
use crate::process::ProcessHandle;
use crate::worker::Worker;

/// Callback run as a concurrent task in the master when the pool starts.
pub type PoolStartHook = Box<dyn FnOnce(Arc<PoolDirectory>) -> BoxFuture<'static, ()> + Send>;

/// Which side of the pool the current process turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    Master,
    Worker(WorkerId),
}

#[async_trait::async_trait]
pub trait PoolDrive: Send {
    fn set_span(&mut self, span: Span);

    /// Receive the frozen directory and the workers, in id order.
    fn set_workers(&mut self, directory: Arc<PoolDirectory>, workers: Vec<Arc<Worker>>);

    fn on_pool_start(&mut self, hook: PoolStartHook);

    fn process(&self, worker_id: WorkerId) -> Option<ProcessHandle>;

    async fn start(&mut self) -> Result<PoolRole, PoolError>;
}

/// Find the worker a child process was spawned for.
pub(crate) fn worker_for(workers: &[Arc<Worker>], index: u32) -> Result<Arc<Worker>, PoolError> {
    workers
        .iter()
        .find(|w| w.id().get() == index)
        .cloned()
        .ok_or(PoolError::UnknownWorker(WorkerId::new(index)))
}

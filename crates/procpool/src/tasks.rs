//! Tracked tasks for a worker process.
//!
//! Every long-running task a worker starts (receive loop, heartbeat, the
//! application's own tasks) is spawned through a [`TaskSet`] so shutdown can
//! wait for them under one deadline. Tasks are observed, never aborted: a task
//! still alive at the deadline is reported with the place it was spawned from.

use std::future::Future;
use std::panic::Location;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

struct TrackedTask {
    id: u64,
    name: String,
    spawned_at: &'static Location<'static>,
    handle: JoinHandle<()>,
}

/// Outcome of [`TaskSet::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that finished within the budget.
    pub finished: usize,
    /// Names of tasks still running when the budget ran out.
    pub timed_out: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

#[derive(Default)]
pub struct TaskSet {
    tasks: Mutex<Vec<TrackedTask>>,
    next_id: AtomicU64,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named task on the current runtime and track it. The task runs
    /// inside the caller's current span.
    #[track_caller]
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let spawned_at = Location::caller();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        tracing::trace!(task_id = id, task = %name, %spawned_at, "Spawning tracked task");

        let handle = tokio::spawn(future.instrument(tracing::Span::current()));
        self.lock().push(TrackedTask {
            id,
            name,
            spawned_at,
            handle,
        });
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn live(&self) -> usize {
        let mut tasks = self.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.len()
    }

    /// Wait for every tracked task to finish, polling every `poll` for at most
    /// `budget`. Tasks left over are logged and left running.
    pub async fn drain(&self, budget: Duration, poll: Duration) -> DrainReport {
        let deadline = Instant::now() + budget;
        let mut finished = 0;

        loop {
            let remaining = {
                let mut tasks = self.lock();
                let before = tasks.len();
                tasks.retain(|t| !t.handle.is_finished());
                finished += before - tasks.len();
                tasks.len()
            };
            if remaining == 0 {
                return DrainReport {
                    finished,
                    timed_out: Vec::new(),
                };
            }
            if Instant::now() >= deadline {
                break;
            }
            tracing::trace!(remaining, "Waiting for tasks to exit");
            tokio::time::sleep(poll).await;
        }

        let tasks = self.lock();
        let timed_out = tasks
            .iter()
            .map(|t| {
                tracing::warn!(
                    task_id = t.id,
                    task = %t.name,
                    spawned_at = %t.spawned_at,
                    "Task did not exit before shutdown deadline"
                );
                t.name.clone()
            })
            .collect();

        DrainReport {
            finished,
            timed_out,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TrackedTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

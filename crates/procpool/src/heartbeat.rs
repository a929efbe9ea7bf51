//! Master liveness probe.
//!
//! A worker whose master has died terminates itself so it is never left
//! orphaned. The timer ends the moment it fires the self-termination, so the
//! signal is sent at most once.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::process::ProcessHandle;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Process operations used by the heartbeat.
pub trait ProcessProbe: Send + Sync + 'static {
    fn is_alive(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32) -> nix::Result<()>;
}

/// Real probe: signal 0 for liveness, SIGTERM for termination.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        ProcessHandle::new(pid).is_alive()
    }

    fn terminate(&self, pid: u32) -> nix::Result<()> {
        ProcessHandle::new(pid).signal(Signal::SIGTERM)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The worker is shutting down.
    Cancelled,
    /// The master vanished and the worker signalled itself.
    MasterGone,
}

pub struct Heartbeat {
    master_pid: u32,
    own_pid: u32,
    interval: Duration,
    probe: Arc<dyn ProcessProbe>,
}

impl Heartbeat {
    pub fn new(master_pid: u32, own_pid: u32, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            master_pid,
            own_pid,
            interval: HEARTBEAT_INTERVAL,
            probe,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, cancel: CancellationToken) -> HeartbeatExit {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return HeartbeatExit::Cancelled,
                _ = ticker.tick() => {}
            }

            if self.probe.is_alive(self.master_pid) {
                continue;
            }

            tracing::warn!(
                master_pid = self.master_pid,
                pid = self.own_pid,
                "Master process is gone, terminating worker"
            );
            if let Err(e) = self.probe.terminate(self.own_pid) {
                tracing::error!(pid = self.own_pid, error = %e, "Failed to signal worker process");
            }
            return HeartbeatExit::MasterGone;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProbe {
        alive_checks: AtomicUsize,
        live_for: usize,
        terminated: AtomicUsize,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, _pid: u32) -> bool {
            self.alive_checks.fetch_add(1, Ordering::SeqCst) < self.live_for
        }

        fn terminate(&self, pid: u32) -> nix::Result<()> {
            assert_eq!(pid, 200);
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dead_master_terminates_self_exactly_once() {
        let probe = Arc::new(FakeProbe {
            live_for: 3,
            ..Default::default()
        });
        let heartbeat = Heartbeat::new(100, 200, probe.clone());

        let start = Instant::now();
        let exit = heartbeat.run(CancellationToken::new()).await;

        assert_eq!(exit, HeartbeatExit::MasterGone);
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
        assert_eq!(probe.terminated.load(Ordering::SeqCst), 1);

        // No re-arming: later ticks never happen.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(probe.alive_checks.load(Ordering::SeqCst), 4);
        assert_eq!(probe.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_probing() {
        let probe = Arc::new(FakeProbe {
            live_for: usize::MAX,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Heartbeat::new(100, 200, probe.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1250)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), HeartbeatExit::Cancelled);
        assert_eq!(probe.alive_checks.load(Ordering::SeqCst), 2);
        assert_eq!(probe.terminated.load(Ordering::SeqCst), 0);
    }
}

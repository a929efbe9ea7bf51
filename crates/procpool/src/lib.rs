//! procpool: supervised worker processes with chunked datagram IPC.
//!
//! Register [`SubProcess`] implementations on a [`ProcessPool`], then start
//! it. Every worker runs in its own OS process (the current binary,
//! re-executed) and can message any sibling by name through
//! [`WorkerContext::send_message`].

pub mod bridge;
pub mod config;
pub mod drive;
pub mod heartbeat;
pub mod logging;
pub mod pool;
pub mod process;
pub mod tasks;
pub mod worker;

pub use bridge::protocol::WorkerId;
pub use config::PoolConfig;
pub use drive::direct::{DirectDrive, ProcessHost, ProcessTable};
pub use drive::native::{NativePool, NativePoolDrive, NativeRole};
pub use drive::{PoolDrive, PoolRole};
pub use pool::{PoolDirectory, PoolError, ProcessPool};
pub use process::{ProcessHandle, WorkerProcess};
pub use worker::{SubProcess, Worker, WorkerContext, WorkerError, WorkerState};

//! Pool configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::codec::ReassemblyLimits;
use crate::bridge::protocol::{DEFAULT_CHUNK_SIZE, HEADER_LEN, ProtocolError};
use crate::process::{ENV_CHUNK_SIZE, ENV_SOCKET_DIR};

pub const ENV_DEBUG: &str = "PROCPOOL_DEBUG";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Frame size in bytes, header included.
    pub chunk_size: usize,
    /// Base directory; sockets live in `{socket_dir}/procpool-{master_pid}`.
    pub socket_dir: PathBuf,
    /// Upper bound of one blocking receive in a worker's receive loop.
    pub receive_timeout: Duration,
    /// Log payload excerpts on decode failures.
    pub debug: bool,
    pub reassembly: ReassemblyLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            socket_dir: std::env::temp_dir(),
            receive_timeout: Duration::from_secs(2),
            debug: false,
            reassembly: ReassemblyLimits::default(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `PROCPOOL_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_reassembly(mut self, limits: ReassemblyLimits) -> Self {
        self.reassembly = limits;
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.chunk_size <= HEADER_LEN {
            return Err(ProtocolError::ChunkTooSmall {
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > HEADER_LEN => self.chunk_size = n,
                _ => tracing::warn!(
                    key = ENV_CHUNK_SIZE,
                    value = %raw,
                    "Ignoring invalid chunk size"
                ),
            }
        }
        if let Some(raw) = lookup(ENV_SOCKET_DIR) {
            if raw.is_empty() {
                tracing::warn!(key = ENV_SOCKET_DIR, "Ignoring empty socket directory");
            } else {
                self.socket_dir = PathBuf::from(raw);
            }
        }
        if let Some(raw) = lookup(ENV_DEBUG) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.debug = true,
                "0" | "false" | "no" | "off" | "" => self.debug = false,
                _ => tracing::warn!(key = ENV_DEBUG, value = %raw, "Ignoring invalid debug flag"),
            }
        }
        self
    }
}

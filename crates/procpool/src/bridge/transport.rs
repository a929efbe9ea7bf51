//! Datagram socket transport for worker IPC.
//!
//! Each worker binds one `SOCK_DGRAM` Unix socket at a path derived from its
//! worker id. Senders connect a short-lived unbound socket to that path and push
//! frames produced by [`FrameCodec`].
//!
//! Socket path format: `{base}/procpool-{master_pid}/worker-{id}.sock`

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UnixDatagram;

use super::codec::FrameCodec;
use super::protocol::{Message, ProtocolError, WorkerId};

const SEND_ATTEMPTS: u32 = 3;
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("wrong data chunk transmission length {sent} != {expected}")]
    ShortWrite { sent: usize, expected: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Directory holding every worker socket of one pool.
pub fn socket_dir(base: &Path, master_pid: u32) -> PathBuf {
    base.join(format!("procpool-{}", master_pid))
}

pub fn worker_socket_path(dir: &Path, worker_id: WorkerId) -> PathBuf {
    dir.join(format!("worker-{}.sock", worker_id))
}

/// Bind the receiving socket for a worker, replacing a stale socket file.
pub fn bind_worker_socket(path: &Path) -> io::Result<UnixDatagram> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let socket = UnixDatagram::bind(path)?;
    tracing::trace!(path = %path.display(), "Bound worker socket");
    Ok(socket)
}

/// Owns the pool's socket directory on the master side.
pub struct SocketDir {
    dir: PathBuf,
}

impl SocketDir {
    pub fn create(dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "Created socket directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "Cleaning up socket directory");
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Drop for SocketDir {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup socket directory");
        }
    }
}

/// Framed send/receive over datagram sockets.
///
/// Shared by reference between a worker's receive loop and its senders. The
/// codec lock is never held across an await.
pub struct Transport {
    codec: Mutex<FrameCodec>,
    chunk_size: usize,
}

impl Transport {
    pub fn new(codec: FrameCodec) -> Self {
        let chunk_size = codec.chunk_size();
        Self {
            codec: Mutex::new(codec),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Send `payload` as a sequence of frames on a connected socket.
    pub async fn send(
        &self,
        socket: &UnixDatagram,
        worker_id: WorkerId,
        payload: impl Into<Bytes>,
    ) -> Result<(), TransportError> {
        let chunks = self
            .codec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generate_chunks(worker_id, payload);
        let message_id = chunks.message_id();

        let mut frames = 0usize;
        for frame in chunks {
            send_all(socket, &frame).await?;
            frames += 1;
        }
        tracing::trace!(%worker_id, message_id, frames, "Sent ipc message");
        Ok(())
    }

    /// Wait up to `timeout` for one datagram.
    ///
    /// `Ok(None)` means either the timeout elapsed or the frame did not
    /// complete a message yet; callers just loop.
    pub async fn receive(
        &self,
        socket: &UnixDatagram,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError> {
        let mut buf = vec![0u8; self.chunk_size];
        let len = match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Ok(None),
        };

        let message = self
            .codec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_frame(&buf[..len])?;
        Ok(message)
    }
}

async fn send_all(socket: &UnixDatagram, frame: &[u8]) -> Result<(), TransportError> {
    let expected = frame.len();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match socket.send(frame).await {
            Ok(sent) if sent == expected => return Ok(()),
            Ok(sent) if attempt >= SEND_ATTEMPTS => {
                return Err(TransportError::ShortWrite { sent, expected });
            }
            Ok(sent) => {
                tracing::debug!(sent, expected, attempt, "Short datagram send, retrying");
            }
            Err(e) if is_transient(&e) && attempt < SEND_ATTEMPTS => {
                tracing::debug!(error = %e, attempt, "Transient send error, retrying");
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
        tokio::time::sleep(SEND_RETRY_BACKOFF * attempt).await;
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(nix::errno::Errno::ENOBUFS as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::HEADER_LEN;

    fn transport(chunk_size: usize) -> Transport {
        Transport::new(FrameCodec::with_chunk_size(chunk_size).unwrap())
    }

    #[test]
    fn socket_paths_are_deterministic() {
        let dir = socket_dir(Path::new("/tmp"), 4242);
        assert_eq!(dir, PathBuf::from("/tmp/procpool-4242"));
        assert_eq!(
            worker_socket_path(&dir, WorkerId::new(3)),
            PathBuf::from("/tmp/procpool-4242/worker-3.sock")
        );
    }

    #[tokio::test]
    async fn multi_frame_message_over_socket_pair() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let sender = transport(64);
        let receiver = transport(64);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        sender.send(&a, WorkerId::new(2), payload.clone()).await.unwrap();

        let mut received = None;
        for _ in 0..((1000 / (64 - HEADER_LEN)) + 1) {
            if let Some(msg) = receiver.receive(&b, Duration::from_secs(1)).await.unwrap() {
                received = Some(msg);
                break;
            }
        }
        let msg = received.expect("message should complete");
        assert_eq!(msg.source, WorkerId::new(2));
        assert_eq!(&msg.payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn receive_timeout_is_not_an_error() {
        let (_a, b) = UnixDatagram::pair().unwrap();
        let t = transport(64);
        let result = t.receive(&b, Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn receive_surfaces_protocol_errors() {
        let (a, b) = UnixDatagram::pair().unwrap();
        a.send(&[7u8; HEADER_LEN]).await.unwrap();

        let err = transport(64)
            .receive(&b, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::UnknownProtocol(7))
        ));
    }

    #[tokio::test]
    async fn send_to_closed_peer_fails() {
        let (a, b) = UnixDatagram::pair().unwrap();
        drop(b);
        let err = transport(64)
            .send(&a, WorkerId::new(0), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = worker_socket_path(tmp.path(), WorkerId::new(0));
        std::fs::write(&path, b"stale").unwrap();

        let socket = bind_worker_socket(&path).unwrap();
        assert_eq!(
            socket.local_addr().unwrap().as_pathname(),
            Some(path.as_path())
        );
    }

    #[test]
    fn socket_dir_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = socket_dir(tmp.path(), 1);
        {
            let guard = SocketDir::create(dir.clone()).unwrap();
            assert!(guard.path().is_dir());
        }
        assert!(!dir.exists());
    }
}

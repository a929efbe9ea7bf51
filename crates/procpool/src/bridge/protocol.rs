//! Wire types for worker-to-worker IPC.
//!
//! Every datagram is one frame: a fixed 10-byte header followed by a chunk of
//! the application payload.
//!
//! ```text
//! ┌──────────┬───────────┬────────────┬──────┬───────────────┐
//! │ protocol │ worker id │ message id │ done │ chunk ...     │
//! │ u8 (=1)  │ u32 BE    │ u32 BE     │ u8   │               │
//! └──────────┴───────────┴────────────┴──────┴───────────────┘
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Header length in bytes.
pub const HEADER_LEN: usize = 10;

/// Default frame size, header included.
pub const DEFAULT_CHUNK_SIZE: usize = 65535;

/// Identifier of a registered worker.
///
/// Assigned sequentially by the pool in registration order, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Protocol tag carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ipc,
}

impl Protocol {
    pub const fn tag(self) -> u8 {
        match self {
            Self::Ipc => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(Self::Ipc),
            other => Err(ProtocolError::UnknownProtocol(other)),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown ipc message protocol: {0}")]
    UnknownProtocol(u8),

    #[error("frame too short: {len} bytes, header needs {HEADER_LEN}")]
    Truncated { len: usize },

    #[error("chunk size {chunk_size} must exceed the {HEADER_LEN}-byte header")]
    ChunkTooSmall { chunk_size: usize },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub protocol: Protocol,
    pub worker_id: WorkerId,
    pub message_id: u32,
    pub done: bool,
}

impl FrameHeader {
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_u8(self.protocol.tag());
        dst.put_u32(self.worker_id.get());
        dst.put_u32(self.message_id);
        dst.put_u8(u8::from(self.done));
    }

    /// Split a raw frame into its header and chunk.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated { len: frame.len() });
        }
        let (mut head, chunk) = frame.split_at(HEADER_LEN);
        let protocol = Protocol::from_tag(head.get_u8())?;
        let worker_id = WorkerId::new(head.get_u32());
        let message_id = head.get_u32();
        let done = head.get_u8() != 0;

        Ok((
            Self {
                protocol,
                worker_id,
                message_id,
                done,
            },
            chunk,
        ))
    }
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol: Protocol,
    pub source: WorkerId,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn header_is_big_endian() {
        let header = FrameHeader {
            protocol: Protocol::Ipc,
            worker_id: WorkerId::new(32),
            message_id: 258,
            done: true,
        };
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);

        assert_eq!(buf.len(), HEADER_LEN);
        insta::assert_snapshot!(hex(&buf), @"01000000200000010201");
    }

    #[test]
    fn decode_splits_chunk() {
        let mut buf = BytesMut::new();
        FrameHeader {
            protocol: Protocol::Ipc,
            worker_id: WorkerId::new(7),
            message_id: 3,
            done: false,
        }
        .encode_into(&mut buf);
        buf.extend_from_slice(b"abc");

        let (header, chunk) = FrameHeader::decode(&buf).unwrap();
        assert_eq!(header.worker_id, WorkerId::new(7));
        assert_eq!(header.message_id, 3);
        assert!(!header.done);
        assert_eq!(chunk, b"abc");
    }

    #[test]
    fn decode_rejects_unknown_protocol() {
        let mut frame = vec![9u8; HEADER_LEN];
        frame[9] = 1;
        assert_eq!(
            FrameHeader::decode(&frame).unwrap_err(),
            ProtocolError::UnknownProtocol(9)
        );
    }

    #[test]
    fn decode_rejects_short_frame() {
        assert_eq!(
            FrameHeader::decode(&[1, 0, 0]).unwrap_err(),
            ProtocolError::Truncated { len: 3 }
        );
    }

    #[test]
    fn protocol_displays_as_ipc() {
        assert_eq!(Protocol::Ipc.to_string(), "ipc");
        assert_eq!(WorkerId::new(4).to_string(), "4");
    }
}

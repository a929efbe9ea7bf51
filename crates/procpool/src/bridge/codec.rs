//! Chunked frame codec.
//!
//! Splits an application payload into fixed-size frames and reassembles
//! frames back into whole messages, keyed by (protocol, worker id, message id).
//! Frames of one message must arrive in the order they were generated; local
//! datagram sockets preserve per-sender ordering.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use super::protocol::{
    DEFAULT_CHUNK_SIZE, FrameHeader, HEADER_LEN, Message, Protocol, ProtocolError, WorkerId,
};

/// Bounds on in-flight reassembly state.
///
/// A sender that dies mid-message would otherwise leave its partial buffer
/// behind forever. Once a partial message is dropped, the rest of its frames
/// are discarded too, so a cut-short payload is never delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Maximum number of partial messages held at once. Zero disables the cap.
    pub max_entries: usize,
    /// Partial messages older than this are dropped.
    pub max_age: Duration,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_age: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ReassemblyKey {
    protocol: Protocol,
    source: WorkerId,
    message_id: u32,
}

struct Partial {
    buf: BytesMut,
    started_at: Instant,
}

/// Frame codec with per-instance message ids and a private reassembly buffer.
pub struct FrameCodec {
    chunk_size: usize,
    next_message_id: u32,
    limits: ReassemblyLimits,
    buffers: HashMap<ReassemblyKey, Partial>,
    /// Keys of dropped partial messages, with the time they were dropped.
    dropped: HashMap<ReassemblyKey, Instant>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            next_message_id: 0,
            limits: ReassemblyLimits::default(),
            buffers: HashMap::new(),
            dropped: HashMap::new(),
        }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Result<Self, ProtocolError> {
        if chunk_size <= HEADER_LEN {
            return Err(ProtocolError::ChunkTooSmall { chunk_size });
        }
        Ok(Self {
            chunk_size,
            ..Self::new()
        })
    }

    pub fn with_limits(mut self, limits: ReassemblyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of partially reassembled messages.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Split `payload` into frames under a fresh message id.
    ///
    /// `worker_id` is written into every header; senders pass their own id so
    /// the receiver can tell who the message came from. The final frame is
    /// marked done, and an empty payload still yields exactly one frame.
    pub fn generate_chunks(&mut self, worker_id: WorkerId, payload: impl Into<Bytes>) -> Chunks {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        Chunks {
            worker_id,
            message_id: self.next_message_id,
            payload: payload.into(),
            piece_len: self.chunk_size - HEADER_LEN,
            sent: 0,
            finished: false,
        }
    }

    /// Feed one received frame. Returns the message once its last frame lands.
    pub fn read_frame(&mut self, frame: &[u8]) -> Result<Option<Message>, ProtocolError> {
        let (header, chunk) = FrameHeader::decode(frame)?;
        let key = ReassemblyKey {
            protocol: header.protocol,
            source: header.worker_id,
            message_id: header.message_id,
        };

        let now = Instant::now();
        self.evict_expired(now);

        if self.dropped.contains_key(&key) {
            tracing::warn!(
                source = %key.source,
                message_id = key.message_id,
                chunk_len = chunk.len(),
                done = header.done,
                "Discarding frame of dropped ipc message"
            );
            if header.done {
                self.dropped.remove(&key);
            }
            return Ok(None);
        }

        if header.done && !self.buffers.contains_key(&key) {
            return Ok(Some(Message {
                protocol: key.protocol,
                source: key.source,
                payload: Bytes::copy_from_slice(chunk),
            }));
        }

        if !self.buffers.contains_key(&key) {
            self.make_room();
        }
        self.buffers
            .entry(key)
            .or_insert_with(|| Partial {
                buf: BytesMut::new(),
                started_at: now,
            })
            .buf
            .extend_from_slice(chunk);

        if !header.done {
            return Ok(None);
        }

        Ok(self.buffers.remove(&key).map(|partial| Message {
            protocol: key.protocol,
            source: key.source,
            payload: partial.buf.freeze(),
        }))
    }

    fn evict_expired(&mut self, now: Instant) {
        let max_age = self.limits.max_age;
        self.dropped
            .retain(|_, dropped_at| now.saturating_duration_since(*dropped_at) <= max_age);

        let mut expired = Vec::new();
        self.buffers.retain(|key, partial| {
            let age = now.saturating_duration_since(partial.started_at);
            if age <= max_age {
                return true;
            }
            tracing::warn!(
                source = %key.source,
                message_id = key.message_id,
                buffered_bytes = partial.buf.len(),
                age_ms = age.as_millis() as u64,
                "Dropping stale partial ipc message"
            );
            expired.push(*key);
            false
        });
        for key in expired {
            self.remember_dropped(key, now);
        }
    }

    fn remember_dropped(&mut self, key: ReassemblyKey, now: Instant) {
        let cap = self.limits.max_entries;
        if cap > 0 && self.dropped.len() >= cap {
            let oldest = self
                .dropped
                .iter()
                .min_by_key(|(_, dropped_at)| **dropped_at)
                .map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                self.dropped.remove(&oldest);
            }
        }
        self.dropped.insert(key, now);
    }

    fn make_room(&mut self) {
        if self.limits.max_entries == 0 {
            return;
        }
        while self.buffers.len() >= self.limits.max_entries {
            let Some(oldest) = self
                .buffers
                .iter()
                .min_by_key(|(_, partial)| partial.started_at)
                .map(|(key, _)| *key)
            else {
                return;
            };
            if let Some(partial) = self.buffers.remove(&oldest) {
                tracing::warn!(
                    source = %oldest.source,
                    message_id = oldest.message_id,
                    buffered_bytes = partial.buf.len(),
                    limit = self.limits.max_entries,
                    "Reassembly buffer full, dropping oldest partial ipc message"
                );
                self.remember_dropped(oldest, Instant::now());
            }
        }
    }
}

/// Lazy frame sequence produced by [`FrameCodec::generate_chunks`].
pub struct Chunks {
    worker_id: WorkerId,
    message_id: u32,
    payload: Bytes,
    piece_len: usize,
    sent: usize,
    finished: bool,
}

impl Chunks {
    pub fn message_id(&self) -> u32 {
        self.message_id
    }
}

impl Iterator for Chunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }

        let total = self.payload.len();
        let end = self.sent.saturating_add(self.piece_len).min(total);
        let piece = self.payload.slice(self.sent..end);
        self.sent += piece.len();
        assert!(
            self.sent <= total,
            "wrong data transmission length {} > {}",
            self.sent,
            total
        );
        let done = self.sent == total;
        self.finished = done;

        let mut frame = BytesMut::with_capacity(HEADER_LEN + piece.len());
        FrameHeader {
            protocol: Protocol::Ipc,
            worker_id: self.worker_id,
            message_id: self.message_id,
            done,
        }
        .encode_into(&mut frame);
        frame.extend_from_slice(&piece);
        Some(frame.freeze())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            return (0, Some(0));
        }
        let remaining = self.payload.len() - self.sent;
        let frames = remaining.div_ceil(self.piece_len).max(1);
        (frames, Some(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn chunk_size_must_exceed_header() {
        assert!(matches!(
            FrameCodec::with_chunk_size(HEADER_LEN),
            Err(ProtocolError::ChunkTooSmall { chunk_size: 10 })
        ));
        assert!(FrameCodec::with_chunk_size(HEADER_LEN + 1).is_ok());
    }

    #[test]
    fn ninety_six_bytes_in_thirty_two_byte_frames() {
        let mut codec = FrameCodec::with_chunk_size(32).unwrap();
        let message = "123456".repeat(16);
        assert_eq!(message.len(), 96);

        let frames: Vec<Bytes> = codec
            .generate_chunks(WorkerId::new(32), message.clone())
            .collect();
        let sizes: Vec<usize> = frames.iter().map(|f| f.len() - HEADER_LEN).collect();
        assert_eq!(sizes, vec![22, 22, 22, 22, 8]);

        for frame in &frames[..4] {
            assert_eq!(codec.read_frame(frame).unwrap(), None);
        }
        let msg = codec.read_frame(&frames[4]).unwrap().unwrap();
        assert_eq!(msg.protocol.as_str(), "ipc");
        assert_eq!(msg.source, WorkerId::new(32));
        assert_eq!(&msg.payload[..], message.as_bytes());
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn round_trip_across_chunk_sizes() {
        for chunk_size in [11, 12, 17, 64, 1500] {
            for len in [0, 1, 9, 100, 4097] {
                let mut sender = FrameCodec::with_chunk_size(chunk_size).unwrap();
                let mut receiver = FrameCodec::with_chunk_size(chunk_size).unwrap();
                let data = payload(len);

                let frames: Vec<Bytes> = sender.generate_chunks(WorkerId::new(3), data.clone()).collect();
                let (last, rest) = frames.split_last().unwrap();
                for frame in rest {
                    assert_eq!(receiver.read_frame(frame).unwrap(), None);
                }
                let msg = receiver.read_frame(last).unwrap().unwrap();
                assert_eq!(msg.source, WorkerId::new(3));
                assert_eq!(&msg.payload[..], &data[..], "chunk_size={chunk_size} len={len}");
            }
        }
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_frame() {
        let mut codec = FrameCodec::with_chunk_size(32).unwrap();
        let frames: Vec<Bytes> = codec.generate_chunks(WorkerId::new(1), payload(44)).collect();

        assert_eq!(frames.len(), 2);
        let (first, _) = FrameHeader::decode(&frames[0]).unwrap();
        let (last, chunk) = FrameHeader::decode(&frames[1]).unwrap();
        assert!(!first.done);
        assert!(last.done);
        assert_eq!(chunk.len(), 22);
    }

    #[test]
    fn empty_payload_is_one_done_frame() {
        let mut codec = FrameCodec::new();
        let frames: Vec<Bytes> = codec.generate_chunks(WorkerId::new(0), Bytes::new()).collect();
        assert_eq!(frames.len(), 1);

        let msg = codec.read_frame(&frames[0]).unwrap().unwrap();
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn message_ids_increase_regardless_of_worker() {
        let mut codec = FrameCodec::new();
        let ids: Vec<u32> = [5, 1, 5, 9]
            .into_iter()
            .map(|w| codec.generate_chunks(WorkerId::new(w), "x").message_id())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn size_hint_matches_frame_count() {
        let mut codec = FrameCodec::with_chunk_size(32).unwrap();
        let chunks = codec.generate_chunks(WorkerId::new(0), payload(96));
        assert_eq!(chunks.size_hint(), (5, Some(5)));
        assert_eq!(chunks.count(), 5);
    }

    #[test]
    fn interleaved_messages_stay_isolated() {
        let mut a = FrameCodec::with_chunk_size(16).unwrap();
        let mut b = FrameCodec::with_chunk_size(16).unwrap();
        let mut receiver = FrameCodec::with_chunk_size(16).unwrap();

        let data_a = b"alpha alpha alpha alpha alpha".to_vec();
        let data_b = b"bravo bravo bravo bravo bravo bravo".to_vec();
        // Same message id (1) from two different senders.
        let frames_a: Vec<Bytes> = a.generate_chunks(WorkerId::new(1), data_a.clone()).collect();
        let frames_b: Vec<Bytes> = b.generate_chunks(WorkerId::new(2), data_b.clone()).collect();

        let mut done = Vec::new();
        let mut ia = frames_a.iter();
        let mut ib = frames_b.iter();
        loop {
            let fa = ia.next();
            let fb = ib.next();
            if fa.is_none() && fb.is_none() {
                break;
            }
            for frame in fa.into_iter().chain(fb) {
                if let Some(msg) = receiver.read_frame(frame).unwrap() {
                    done.push(msg);
                }
            }
        }

        assert_eq!(done.len(), 2);
        let from_a = done.iter().find(|m| m.source == WorkerId::new(1)).unwrap();
        let from_b = done.iter().find(|m| m.source == WorkerId::new(2)).unwrap();
        assert_eq!(&from_a.payload[..], &data_a[..]);
        assert_eq!(&from_b.payload[..], &data_b[..]);
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut frame = vec![0u8; HEADER_LEN + 2];
        frame[0] = 2;
        assert_eq!(
            codec.read_frame(&frame).unwrap_err(),
            ProtocolError::UnknownProtocol(2)
        );
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn full_buffer_drops_oldest_partial() {
        let mut sender = FrameCodec::with_chunk_size(12).unwrap();
        let mut receiver = FrameCodec::with_chunk_size(12).unwrap().with_limits(ReassemblyLimits {
            max_entries: 2,
            max_age: Duration::from_secs(60),
        });

        let firsts: Vec<Bytes> = (0..3)
            .map(|_| sender.generate_chunks(WorkerId::new(1), "abcd").next().unwrap())
            .collect();
        for frame in &firsts {
            assert_eq!(receiver.read_frame(frame).unwrap(), None);
        }
        assert_eq!(receiver.pending(), 2);
    }

    #[test]
    fn dropped_partial_never_completes() {
        let mut first = FrameCodec::with_chunk_size(12).unwrap();
        let mut second = FrameCodec::with_chunk_size(12).unwrap();
        let mut receiver = FrameCodec::with_chunk_size(12).unwrap().with_limits(ReassemblyLimits {
            max_entries: 1,
            max_age: Duration::from_secs(60),
        });

        let cut: Vec<Bytes> = first.generate_chunks(WorkerId::new(1), "AABBCC").collect();
        let other: Vec<Bytes> = second.generate_chunks(WorkerId::new(2), "DDEE").collect();
        assert_eq!(cut.len(), 3);

        assert_eq!(receiver.read_frame(&cut[0]).unwrap(), None);
        // Evicts worker 1's partial message.
        assert_eq!(receiver.read_frame(&other[0]).unwrap(), None);
        assert_eq!(receiver.read_frame(&cut[1]).unwrap(), None);
        assert_eq!(receiver.read_frame(&cut[2]).unwrap(), None);

        let msg = receiver.read_frame(&other[1]).unwrap().unwrap();
        assert_eq!(&msg.payload[..], b"DDEE");
        assert_eq!(receiver.pending(), 0);

        // The next message from the same sender is unaffected.
        let next: Vec<Bytes> = first.generate_chunks(WorkerId::new(1), "FFGG").collect();
        assert_eq!(receiver.read_frame(&next[0]).unwrap(), None);
        let msg = receiver.read_frame(&next[1]).unwrap().unwrap();
        assert_eq!(&msg.payload[..], b"FFGG");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_partials_are_evicted() {
        let mut sender = FrameCodec::with_chunk_size(12).unwrap();
        let mut receiver = FrameCodec::with_chunk_size(12).unwrap();

        let orphan: Vec<Bytes> = sender.generate_chunks(WorkerId::new(4), "orphan").collect();
        receiver.read_frame(&orphan[0]).unwrap();
        assert_eq!(receiver.pending(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;

        let fresh: Vec<Bytes> = sender.generate_chunks(WorkerId::new(4), "x").collect();
        let msg = receiver.read_frame(&fresh[0]).unwrap().unwrap();
        assert_eq!(&msg.payload[..], b"x");
        assert_eq!(receiver.pending(), 0);

        // The orphan's late tail is discarded rather than delivered as "phan".
        assert_eq!(orphan.len(), 3);
        for frame in &orphan[1..] {
            assert_eq!(receiver.read_frame(frame).unwrap(), None);
        }
        assert_eq!(receiver.pending(), 0);
    }
}

//! Frame ring: one direction of a session wire.
//!
//! ```text
//! [RingHeader: head u64 | tail u64 | notify u32 | closed u32]
//! [frame 0][frame 1]...[frame N-1]
//! frame = [slot u16 | kind u8 | flags u8 | len u32][payload: capacity bytes]
//! ```
//!
//! `head` counts frames published by the writer, `tail` counts frames
//! consumed by the reader; `head - tail` is never more than the frame count.
//! A message longer than one frame is split into consecutive fragments, the
//! final one flagged `LAST`. One process writes and one process reads each
//! ring; within a process, writers and readers are serialized by mutexes.

#![allow(unsafe_code)]

use super::protocol::FrameKind;
use crate::config::TransportConfig;
use crate::error::{Result, TgError};
use crate::shm::{self, align_up, SharedLayout, SharedSegment, WaitPolicy};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

#[repr(C)]
struct RingHeader {
    head: AtomicU64,
    tail: AtomicU64,
    notify: AtomicU32,
    closed: AtomicU32,
}

// SAFETY: repr(C), atomics only.
unsafe impl SharedLayout for RingHeader {}

const FRAME_HEADER_LEN: usize = 8;
const FLAG_LAST: u8 = 0x01;
const RING_HEADER_LEN: usize = align_up(size_of::<RingHeader>(), 64);

/// A reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub slot: u16,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Geometry of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub frame_count: u32,
    pub frame_payload: u32,
}

impl RingGeometry {
    fn stride(&self) -> usize {
        align_up(FRAME_HEADER_LEN + self.frame_payload as usize, 8)
    }

    /// Bytes occupied by a ring with this geometry, header included.
    pub fn size(&self) -> usize {
        RING_HEADER_LEN + self.frame_count as usize * self.stride()
    }
}

/// Handle on a ring inside a mapped segment.
#[derive(Debug)]
pub struct FrameRing {
    segment: Arc<SharedSegment>,
    offset: usize,
    geometry: RingGeometry,
    session_id: u64,
    write_lock: Mutex<()>,
    read_lock: Mutex<()>,
}

impl FrameRing {
    /// Bind a ring at `offset`. The caller guarantees `geometry.size()` bytes
    /// starting there belong to this ring.
    pub fn new(
        segment: Arc<SharedSegment>,
        offset: usize,
        geometry: RingGeometry,
        session_id: u64,
    ) -> Result<Self> {
        if geometry.frame_count == 0 || geometry.frame_payload == 0 {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: "ring geometry must be non-zero".to_string(),
            });
        }
        // Validate bounds once so later views cannot fail on range.
        segment.view::<RingHeader>(offset)?;
        if offset + geometry.size() > segment.len() {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: format!(
                    "ring at {} of size {} exceeds segment",
                    offset,
                    geometry.size()
                ),
            });
        }
        Ok(Self {
            segment,
            offset,
            geometry,
            session_id,
            write_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
        })
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    fn header(&self) -> Result<&RingHeader> {
        self.segment.view(self.offset)
    }

    fn frame_offset(&self, sequence: u64) -> usize {
        let index = (sequence % u64::from(self.geometry.frame_count)) as usize;
        self.offset + RING_HEADER_LEN + index * self.geometry.stride()
    }

    fn closed_error(&self) -> TgError {
        TgError::SessionClosed {
            session_id: self.session_id,
        }
    }

    /// Mark the ring closed and wake both sides.
    pub fn close(&self) -> Result<()> {
        let header = self.header()?;
        header.closed.store(1, Ordering::Release);
        shm::notify_all(&header.notify);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.header()
            .map(|h| h.closed.load(Ordering::Acquire) != 0)
            .unwrap_or(true)
    }

    /// Write one message tagged with `slot`, blocking while the ring is full.
    /// The deadline in `policy` applies only until the first fragment is
    /// published; a started message is always completed.
    pub fn write_message(
        &self,
        slot: u16,
        kind: FrameKind,
        payload: &[u8],
        policy: &WaitPolicy<'_>,
    ) -> Result<()> {
        if payload.len() > TransportConfig::MAX_MESSAGE_SIZE {
            return Err(TgError::Validation {
                field: "message".to_string(),
                message: format!("message of {} bytes is too large", payload.len()),
            });
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TgError::Other("ring writer lock poisoned".into()))?;
        let header = self.header()?;
        let capacity = self.geometry.frame_payload as usize;
        let frame_count = u64::from(self.geometry.frame_count);

        let fragments: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(capacity).collect()
        };
        let last_index = fragments.len() - 1;

        let continuation = WaitPolicy {
            deadline: None,
            ..*policy
        };
        let started = std::time::Instant::now();
        for (index, fragment) in fragments.into_iter().enumerate() {
            let last = index == last_index;
            let head = header.head.load(Ordering::Relaxed);
            let wait = if index == 0 { policy } else { &continuation };
            let has_space = shm::wait_until(&header.notify, wait, || {
                if header.closed.load(Ordering::Acquire) != 0 {
                    return Err(self.closed_error());
                }
                let tail = header.tail.load(Ordering::Acquire);
                Ok((head - tail < frame_count).then_some(()))
            })?;
            if has_space.is_none() {
                return Err(TgError::Timeout(started.elapsed()));
            }

            let at = self.frame_offset(head);
            let mut frame_header = [0u8; FRAME_HEADER_LEN];
            frame_header[0..2].copy_from_slice(&slot.to_le_bytes());
            frame_header[2] = kind as u8;
            frame_header[3] = if last { FLAG_LAST } else { 0 };
            frame_header[4..8].copy_from_slice(&(fragment.len() as u32).to_le_bytes());
            self.segment.write_bytes(at, &frame_header)?;
            self.segment.write_bytes(at + FRAME_HEADER_LEN, fragment)?;

            header.head.store(head + 1, Ordering::Release);
            shm::notify_all(&header.notify);
        }

        trace!(
            "Wrote {} bytes on slot {} of session {}",
            payload.len(),
            slot,
            self.session_id
        );
        Ok(())
    }

    /// Read one complete message. Returns `Ok(None)` if the policy deadline
    /// passes before the first fragment arrives; once a message has started,
    /// the rest is awaited without a deadline.
    pub fn read_message(&self, policy: &WaitPolicy<'_>) -> Result<Option<Message>> {
        let _guard = self
            .read_lock
            .lock()
            .map_err(|_| TgError::Other("ring reader lock poisoned".into()))?;
        let header = self.header()?;
        let continuation = WaitPolicy {
            deadline: None,
            ..*policy
        };

        let mut assembled: Option<Message> = None;
        loop {
            let wait = if assembled.is_some() {
                &continuation
            } else {
                policy
            };
            let ready = shm::wait_until(&header.notify, wait, || {
                let tail = header.tail.load(Ordering::Relaxed);
                let head = header.head.load(Ordering::Acquire);
                if tail < head {
                    return Ok(Some(tail));
                }
                if header.closed.load(Ordering::Acquire) != 0 {
                    return Err(self.closed_error());
                }
                Ok(None)
            })?;
            let Some(tail) = ready else {
                return Ok(None);
            };

            let at = self.frame_offset(tail);
            let mut frame_header = [0u8; FRAME_HEADER_LEN];
            self.segment.read_bytes(at, &mut frame_header)?;
            let slot = u16::from_le_bytes([frame_header[0], frame_header[1]]);
            let kind_raw = frame_header[2];
            let flags = frame_header[3];
            let len = u32::from_le_bytes([
                frame_header[4],
                frame_header[5],
                frame_header[6],
                frame_header[7],
            ]) as usize;

            let kind = FrameKind::from_raw(kind_raw).ok_or_else(|| TgError::MalformedFrame {
                message: format!("unknown frame kind {}", kind_raw),
            })?;
            if len > self.geometry.frame_payload as usize {
                return Err(TgError::MalformedFrame {
                    message: format!("frame length {} exceeds capacity", len),
                });
            }

            let message = assembled.get_or_insert_with(|| Message {
                slot,
                kind,
                payload: Vec::new(),
            });
            if message.slot != slot || message.kind != kind {
                return Err(TgError::MalformedFrame {
                    message: format!(
                        "fragment for slot {} interleaved with slot {}",
                        slot, message.slot
                    ),
                });
            }
            if message.payload.len() + len > TransportConfig::MAX_MESSAGE_SIZE {
                return Err(TgError::MalformedFrame {
                    message: "reassembled message exceeds maximum size".to_string(),
                });
            }

            let start = message.payload.len();
            message.payload.resize(start + len, 0);
            self.segment
                .read_bytes(at + FRAME_HEADER_LEN, &mut message.payload[start..])?;

            header.tail.store(tail + 1, Ordering::Release);
            shm::notify_all(&header.notify);

            if flags & FLAG_LAST != 0 {
                return Ok(assembled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::AlwaysAlive;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ring(dir: &TempDir, frame_count: u32, frame_payload: u32) -> (FrameRing, FrameRing) {
        let geometry = RingGeometry {
            frame_count,
            frame_payload,
        };
        let path = dir.path().join("ring");
        let writer_seg = Arc::new(SharedSegment::create(&path, geometry.size()).unwrap());
        let reader_seg = Arc::new(SharedSegment::open(&path).unwrap());
        (
            FrameRing::new(writer_seg, 0, geometry, 1).unwrap(),
            FrameRing::new(reader_seg, 0, geometry, 1).unwrap(),
        )
    }

    fn policy() -> WaitPolicy<'static> {
        WaitPolicy::new(Duration::from_millis(20), &AlwaysAlive)
            .with_timeout(Some(Duration::from_secs(10)))
    }

    #[test]
    fn test_fragmented_message_is_reassembled() {
        let dir = TempDir::new().unwrap();
        let (writer, reader) = ring(&dir, 4, 16);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let producer = {
            let payload = payload.clone();
            std::thread::spawn(move || {
                writer
                    .write_message(3, FrameKind::Request, &payload, &policy())
                    .unwrap();
                writer
            })
        };

        let message = reader.read_message(&policy()).unwrap().unwrap();
        producer.join().unwrap();
        assert_eq!(message.slot, 3);
        assert_eq!(message.kind, FrameKind::Request);
        assert_eq!(message.payload, payload);
    }

    #[test]
    fn test_empty_message() {
        let dir = TempDir::new().unwrap();
        let (writer, reader) = ring(&dir, 2, 64);
        writer
            .write_message(0, FrameKind::Response, b"", &policy())
            .unwrap();
        let message = reader.read_message(&policy()).unwrap().unwrap();
        assert!(message.payload.is_empty());
        assert_eq!(message.kind, FrameKind::Response);
    }

    #[test]
    fn test_read_times_out_when_empty() {
        let dir = TempDir::new().unwrap();
        let (_writer, reader) = ring(&dir, 2, 64);
        let short = WaitPolicy::new(Duration::from_millis(5), &AlwaysAlive)
            .with_timeout(Some(Duration::from_millis(20)));
        assert!(reader.read_message(&short).unwrap().is_none());
    }

    #[test]
    fn test_full_ring_times_out_writer() {
        let dir = TempDir::new().unwrap();
        let (writer, _reader) = ring(&dir, 2, 64);
        let short = WaitPolicy::new(Duration::from_millis(5), &AlwaysAlive)
            .with_timeout(Some(Duration::from_millis(30)));
        writer
            .write_message(0, FrameKind::Request, b"one", &short)
            .unwrap();
        writer
            .write_message(0, FrameKind::Request, b"two", &short)
            .unwrap();
        let err = writer
            .write_message(0, FrameKind::Request, b"three", &short)
            .unwrap_err();
        assert!(matches!(err, TgError::Timeout(_)));
    }

    #[test]
    fn test_deadline_does_not_cut_a_started_message() {
        let dir = TempDir::new().unwrap();
        let (writer, reader) = ring(&dir, 2, 8);
        let payload: Vec<u8> = (0..40u8).collect();

        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            reader.read_message(&policy()).unwrap().unwrap()
        });

        // Two of five fragments fit; the rest wait past the deadline for the
        // reader to drain the ring.
        let short = WaitPolicy::new(Duration::from_millis(5), &AlwaysAlive)
            .with_timeout(Some(Duration::from_millis(30)));
        writer
            .write_message(2, FrameKind::Request, &payload, &short)
            .unwrap();

        let message = consumer.join().unwrap();
        assert_eq!(message.slot, 2);
        assert_eq!(message.payload, payload);
    }

    #[test]
    fn test_closed_ring_fails_reader_after_drain() {
        let dir = TempDir::new().unwrap();
        let (writer, reader) = ring(&dir, 4, 64);
        writer
            .write_message(1, FrameKind::Request, b"last words", &policy())
            .unwrap();
        writer.close().unwrap();

        let message = reader.read_message(&policy()).unwrap().unwrap();
        assert_eq!(message.payload, b"last words");
        assert!(matches!(
            reader.read_message(&policy()),
            Err(TgError::SessionClosed { session_id: 1 })
        ));
        assert!(writer
            .write_message(1, FrameKind::Request, b"more", &policy())
            .is_err());
    }

    #[test]
    fn test_messages_keep_order_and_slots() {
        let dir = TempDir::new().unwrap();
        let (writer, reader) = ring(&dir, 3, 8);

        let producer = std::thread::spawn(move || {
            for i in 0..20u16 {
                let body = format!("message-{}", i);
                writer
                    .write_message(i % 4, FrameKind::Response, body.as_bytes(), &policy())
                    .unwrap();
            }
        });

        for i in 0..20u16 {
            let message = reader.read_message(&policy()).unwrap().unwrap();
            assert_eq!(message.slot, i % 4);
            assert_eq!(message.payload, format!("message-{}", i).into_bytes());
        }
        producer.join().unwrap();
    }
}

//! Resultset wire set: streaming channels for large results.
//!
//! One segment per session (`<shm_dir>/<database>-<session>-rs`), created on
//! the session's first resultset:
//!
//! ```text
//! [SetHeader][ResultsetEntry; W][WireRecord; W][chunk arena: W x chunk_count x stride]
//! chunk = [seq u64 | len u32 | pad u32][payload: chunk_payload bytes]
//! ```
//!
//! A resultset claims one of the W writer wires per writer (blocking while
//! all W are active), publishes chunks stamped with a per-resultset sequence
//! number, and reports end-of-resultset once it is closed and no writer
//! remains. The consumer fetches the chunk carrying the next sequence number
//! and must dispose it before fetching again.

#![allow(unsafe_code)]

use crate::config::TransportConfig;
use crate::error::{Result, TgError};
use crate::shm::{self, align_up, magic, Liveness, SharedLayout, SharedSegment, WaitPolicy, LAYOUT_VERSION};
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[repr(C)]
struct SetHeader {
    magic: AtomicU32,
    version: AtomicU32,
    wire_count: AtomicU32,
    chunk_count: AtomicU32,
    chunk_payload: AtomicU32,
    notify: AtomicU32,
    shutdown: AtomicU32,
    _reserved: u32,
}

#[repr(C)]
struct ResultsetEntry {
    state: AtomicU32,
    writers: AtomicU32,
    closed: AtomicU32,
    eor: AtomicU32,
    abandoned: AtomicU32,
    _reserved: u32,
    next_write_seq: AtomicU64,
    next_read_seq: AtomicU64,
}

#[repr(C)]
struct WireRecord {
    state: AtomicU32,
    resultset: AtomicU32,
    head: AtomicU64,
    tail: AtomicU64,
}

// SAFETY: repr(C), atomics and plain integers only.
unsafe impl SharedLayout for SetHeader {}
// SAFETY: as above.
unsafe impl SharedLayout for ResultsetEntry {}
// SAFETY: as above.
unsafe impl SharedLayout for WireRecord {}

// Entry and wire states. FREEING is a private state held while resetting.
const FREE: u32 = 0;
const OPEN: u32 = 1;
const WRITING: u32 = 1;
const RELEASED: u32 = 2;
const FREEING: u32 = 3;

const CHUNK_HEADER_LEN: usize = 16;

/// Geometry of a resultset wire set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultsetGeometry {
    /// Number of writer wires (W); also the number of concurrently open
    /// resultsets.
    pub wire_count: u32,
    pub chunk_count: u32,
    pub chunk_payload: u32,
}

impl ResultsetGeometry {
    fn entries_offset(&self) -> usize {
        size_of::<SetHeader>()
    }

    fn wires_offset(&self) -> usize {
        self.entries_offset() + self.wire_count as usize * size_of::<ResultsetEntry>()
    }

    fn arena_offset(&self) -> usize {
        align_up(
            self.wires_offset() + self.wire_count as usize * size_of::<WireRecord>(),
            64,
        )
    }

    fn stride(&self) -> usize {
        align_up(CHUNK_HEADER_LEN + self.chunk_payload as usize, 8)
    }

    pub fn segment_size(&self) -> usize {
        self.arena_offset()
            + self.wire_count as usize * self.chunk_count as usize * self.stride()
    }
}

/// Handle on a mapped resultset wire set.
pub struct ResultsetSet {
    segment: SharedSegment,
    geometry: ResultsetGeometry,
    session_id: u64,
    liveness: Arc<dyn Liveness>,
}

impl std::fmt::Debug for ResultsetSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultsetSet")
            .field("segment", &self.segment)
            .field("geometry", &self.geometry)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ResultsetSet {
    /// Create the set (server side). `liveness` watches the consuming client.
    pub fn create(
        path: impl AsRef<Path>,
        geometry: ResultsetGeometry,
        session_id: u64,
        liveness: Arc<dyn Liveness>,
    ) -> Result<Arc<Self>> {
        if geometry.wire_count == 0 || geometry.chunk_count == 0 || geometry.chunk_payload == 0 {
            return Err(TgError::Validation {
                field: "resultset".to_string(),
                message: "geometry must be non-zero".to_string(),
            });
        }
        let segment = SharedSegment::create(path, geometry.segment_size())?;
        let header: &SetHeader = segment.view(0)?;
        header.wire_count.store(geometry.wire_count, Ordering::Relaxed);
        header.chunk_count.store(geometry.chunk_count, Ordering::Relaxed);
        header
            .chunk_payload
            .store(geometry.chunk_payload, Ordering::Relaxed);
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.magic.store(magic::RESULTSET, Ordering::Release);

        debug!(
            "Created resultset set {} ({} wires)",
            segment.path().display(),
            geometry.wire_count
        );
        Self::bind(segment, geometry, session_id, liveness)
    }

    /// Map an existing set (client side). `liveness` watches the server.
    pub fn open(
        path: impl AsRef<Path>,
        session_id: u64,
        liveness: Arc<dyn Liveness>,
    ) -> Result<Arc<Self>> {
        let segment = SharedSegment::open(path)?;
        let header: &SetHeader = segment.view(0)?;
        let found = header.magic.load(Ordering::Acquire);
        if found != magic::RESULTSET || header.version.load(Ordering::Relaxed) != LAYOUT_VERSION {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: format!("not a resultset set (magic {:#x})", found),
            });
        }
        let geometry = ResultsetGeometry {
            wire_count: header.wire_count.load(Ordering::Relaxed),
            chunk_count: header.chunk_count.load(Ordering::Relaxed),
            chunk_payload: header.chunk_payload.load(Ordering::Relaxed),
        };
        if geometry.segment_size() > segment.len() {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: "published geometry exceeds segment".to_string(),
            });
        }
        Self::bind(segment, geometry, session_id, liveness)
    }

    fn bind(
        segment: SharedSegment,
        geometry: ResultsetGeometry,
        session_id: u64,
        liveness: Arc<dyn Liveness>,
    ) -> Result<Arc<Self>> {
        let set = Self {
            segment,
            geometry,
            session_id,
            liveness,
        };
        // Bounds-check every table once.
        set.entries()?;
        set.wires()?;
        Ok(Arc::new(set))
    }

    pub fn remove(path: impl AsRef<Path>) -> Result<bool> {
        SharedSegment::remove(path)
    }

    pub fn geometry(&self) -> ResultsetGeometry {
        self.geometry
    }

    fn header(&self) -> Result<&SetHeader> {
        self.segment.view(0)
    }

    fn entries(&self) -> Result<&[ResultsetEntry]> {
        self.segment.view_slice(
            self.geometry.entries_offset(),
            self.geometry.wire_count as usize,
        )
    }

    fn wires(&self) -> Result<&[WireRecord]> {
        self.segment
            .view_slice(self.geometry.wires_offset(), self.geometry.wire_count as usize)
    }

    fn entry(&self, index: u32) -> Result<&ResultsetEntry> {
        self.entries()?
            .get(index as usize)
            .ok_or_else(|| TgError::Validation {
                field: "resultset".to_string(),
                message: format!("resultset index {} out of range", index),
            })
    }

    fn wire(&self, index: u32) -> Result<&WireRecord> {
        self.wires()?
            .get(index as usize)
            .ok_or_else(|| TgError::Validation {
                field: "wire".to_string(),
                message: format!("wire index {} out of range", index),
            })
    }

    fn chunk_offset(&self, wire: u32, sequence: u64) -> usize {
        let index = (sequence % u64::from(self.geometry.chunk_count)) as usize;
        self.geometry.arena_offset()
            + (wire as usize * self.geometry.chunk_count as usize + index) * self.geometry.stride()
    }

    fn policy(&self) -> WaitPolicy<'_> {
        WaitPolicy::new(TransportConfig::WAIT_QUANTUM, self.liveness.as_ref())
    }

    fn notify(&self) {
        if let Ok(header) = self.header() {
            shm::notify_all(&header.notify);
        }
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.header()?.shutdown.load(Ordering::Acquire) != 0 {
            return Err(TgError::SessionClosed {
                session_id: self.session_id,
            });
        }
        Ok(())
    }

    /// Wake and fail every blocked party. Called on session teardown.
    pub fn shutdown(&self) -> Result<()> {
        let header = self.header()?;
        header.shutdown.store(1, Ordering::Release);
        shm::notify_all(&header.notify);
        Ok(())
    }

    /// Number of wires currently assigned to a writer.
    pub fn active_writers(&self) -> usize {
        self.wires()
            .map(|wires| {
                wires
                    .iter()
                    .filter(|w| w.state.load(Ordering::Acquire) == WRITING)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Open a new resultset (server side), blocking while all entries are in use.
    pub fn open_resultset(self: &Arc<Self>) -> Result<ResultsetHandle> {
        let header = self.header()?;
        let index = shm::wait_until(&header.notify, &self.policy(), || {
            self.check_shutdown()?;
            for (index, entry) in self.entries()?.iter().enumerate() {
                if entry
                    .state
                    .compare_exchange(FREE, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(Some(index as u32));
                }
            }
            Ok(None)
        })?
        .ok_or_else(|| TgError::Other("resultset wait ended without a deadline".into()))?;

        debug!("Opened resultset {} on session {}", index, self.session_id);
        Ok(ResultsetHandle {
            set: self.clone(),
            index,
            closed: false,
        })
    }

    /// Consumer for resultset `index` (client side).
    pub fn reader(self: &Arc<Self>, index: u32) -> Result<ResultsetReader> {
        let entry = self.entry(index)?;
        if entry.state.load(Ordering::Acquire) != OPEN {
            return Err(TgError::Validation {
                field: "resultset".to_string(),
                message: format!("resultset {} is not open", index),
            });
        }
        Ok(ResultsetReader {
            set: self.clone(),
            index,
            finished: false,
        })
    }

    fn try_publish_eor(&self, index: u32) -> Result<()> {
        let entry = self.entry(index)?;
        if entry.closed.load(Ordering::SeqCst) != 0 && entry.writers.load(Ordering::SeqCst) == 0 {
            if entry
                .eor
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!("End of resultset {} on session {}", index, self.session_id);
            }
            self.notify();
            if entry.abandoned.load(Ordering::SeqCst) != 0 {
                self.reclaim_abandoned(index)?;
            }
        }
        Ok(())
    }

    /// Free a wire once it is released and drained (or its consumer left).
    fn try_free_wire(&self, wire_index: u32) -> Result<()> {
        let wire = self.wire(wire_index)?;
        if wire.state.load(Ordering::Acquire) != RELEASED {
            return Ok(());
        }
        let resultset = wire.resultset.load(Ordering::Acquire);
        let drained = wire.tail.load(Ordering::Acquire) == wire.head.load(Ordering::Acquire);
        let abandoned = self
            .entry(resultset)
            .map(|e| e.abandoned.load(Ordering::Acquire) != 0)
            .unwrap_or(true);
        if !(drained || abandoned) {
            return Ok(());
        }
        if wire
            .state
            .compare_exchange(RELEASED, FREEING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            wire.head.store(0, Ordering::Relaxed);
            wire.tail.store(0, Ordering::Relaxed);
            wire.state.store(FREE, Ordering::Release);
            self.notify();
        }
        Ok(())
    }

    fn free_entry(&self, index: u32) -> Result<()> {
        let entry = self.entry(index)?;
        if entry
            .state
            .compare_exchange(OPEN, FREEING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            entry.writers.store(0, Ordering::Relaxed);
            entry.closed.store(0, Ordering::Relaxed);
            entry.eor.store(0, Ordering::Relaxed);
            entry.abandoned.store(0, Ordering::Relaxed);
            entry.next_write_seq.store(0, Ordering::Relaxed);
            entry.next_read_seq.store(0, Ordering::Relaxed);
            entry.state.store(FREE, Ordering::Release);
            self.notify();
        }
        Ok(())
    }

    /// Free everything a departed consumer left behind once writers are done.
    fn reclaim_abandoned(&self, index: u32) -> Result<()> {
        let entry = self.entry(index)?;
        if entry.eor.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        for (wire_index, wire) in self.wires()?.iter().enumerate() {
            if wire.resultset.load(Ordering::Acquire) == index {
                self.try_free_wire(wire_index as u32)?;
            }
        }
        self.free_entry(index)
    }
}

/// Server-side handle on one open resultset. Dropping it closes the resultset.
#[derive(Debug)]
pub struct ResultsetHandle {
    set: Arc<ResultsetSet>,
    index: u32,
    closed: bool,
}

impl ResultsetHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Claim a writer wire, blocking while all W are active.
    pub fn acquire_writer(&self) -> Result<ResultsetWriter> {
        let set = &self.set;
        let entry = set.entry(self.index)?;

        entry.writers.fetch_add(1, Ordering::SeqCst);
        if entry.closed.load(Ordering::SeqCst) != 0 {
            entry.writers.fetch_sub(1, Ordering::SeqCst);
            set.try_publish_eor(self.index)?;
            return Err(TgError::Validation {
                field: "resultset".to_string(),
                message: format!("resultset {} is closed", self.index),
            });
        }

        let header = set.header()?;
        let claimed = shm::wait_until(&header.notify, &set.policy(), || {
            set.check_shutdown()?;
            for (index, wire) in set.wires()?.iter().enumerate() {
                if wire
                    .state
                    .compare_exchange(FREE, WRITING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    wire.resultset.store(self.index, Ordering::Release);
                    return Ok(Some(index as u32));
                }
            }
            Ok(None)
        });

        match claimed {
            Ok(Some(wire)) => Ok(ResultsetWriter {
                set: set.clone(),
                resultset: self.index,
                wire,
                buffer: Vec::with_capacity(set.geometry.chunk_payload as usize),
                released: false,
            }),
            Ok(None) => Err(TgError::Other("writer wait ended without a deadline".into())),
            Err(e) => {
                entry.writers.fetch_sub(1, Ordering::SeqCst);
                set.try_publish_eor(self.index)?;
                Err(e)
            }
        }
    }

    /// Close the resultset. End-of-resultset follows once every writer has
    /// been released.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.set
            .entry(self.index)?
            .closed
            .store(1, Ordering::SeqCst);
        self.set.try_publish_eor(self.index)
    }
}

impl Drop for ResultsetHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close resultset {}: {}", self.index, e);
        }
    }
}

/// Writer bound to one wire. Bytes are buffered and published as full
/// chunks, or on [`ResultsetWriter::flush`].
#[derive(Debug)]
pub struct ResultsetWriter {
    set: Arc<ResultsetSet>,
    resultset: u32,
    wire: u32,
    buffer: Vec<u8>,
    released: bool,
}

impl ResultsetWriter {
    pub fn wire_index(&self) -> u32 {
        self.wire
    }

    pub fn write(&mut self, mut bytes: &[u8]) -> Result<()> {
        let capacity = self.set.geometry.chunk_payload as usize;
        while !bytes.is_empty() {
            let room = capacity - self.buffer.len();
            let take = room.min(bytes.len());
            self.buffer.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.buffer.len() == capacity {
                self.publish()?;
            }
        }
        Ok(())
    }

    /// Publish buffered bytes as a chunk, if any.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.publish()
    }

    fn publish(&mut self) -> Result<()> {
        let set = &self.set;
        let header = set.header()?;
        let entry = set.entry(self.resultset)?;
        let wire = set.wire(self.wire)?;
        let chunk_count = u64::from(set.geometry.chunk_count);

        let head = wire.head.load(Ordering::Relaxed);
        shm::wait_until(&header.notify, &set.policy(), || {
            set.check_shutdown()?;
            if entry.abandoned.load(Ordering::Acquire) != 0 {
                return Err(TgError::Other(format!(
                    "resultset {} was abandoned by its consumer",
                    self.resultset
                )));
            }
            Ok((head - wire.tail.load(Ordering::Acquire) < chunk_count).then_some(()))
        })?;

        // Sequence numbers are taken only once space is secured, so every
        // wire holds strictly increasing sequences.
        let sequence = entry.next_write_seq.fetch_add(1, Ordering::AcqRel);
        let at = set.chunk_offset(self.wire, head);
        let mut chunk_header = [0u8; CHUNK_HEADER_LEN];
        chunk_header[0..8].copy_from_slice(&sequence.to_le_bytes());
        chunk_header[8..12].copy_from_slice(&(self.buffer.len() as u32).to_le_bytes());
        set.segment.write_bytes(at, &chunk_header)?;
        set.segment.write_bytes(at + CHUNK_HEADER_LEN, &self.buffer)?;

        wire.head.store(head + 1, Ordering::Release);
        shm::notify_all(&header.notify);
        self.buffer.clear();
        Ok(())
    }

    /// Flush and give the wire back.
    pub fn release(mut self) -> Result<()> {
        let flushed = self.flush();
        let released = self.release_wire();
        flushed.and(released)
    }

    fn release_wire(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let set = &self.set;
        set.wire(self.wire)?.state.store(RELEASED, Ordering::SeqCst);
        set.try_free_wire(self.wire)?;
        set.entry(self.resultset)?
            .writers
            .fetch_sub(1, Ordering::SeqCst);
        set.try_publish_eor(self.resultset)?;
        set.notify();
        Ok(())
    }
}

impl Drop for ResultsetWriter {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if !self.buffer.is_empty() {
            warn!(
                "Discarding {} unflushed bytes of resultset {}",
                self.buffer.len(),
                self.resultset
            );
        }
        if let Err(e) = self.release_wire() {
            warn!("Failed to release resultset wire {}: {}", self.wire, e);
        }
    }
}

/// Result of a fetch.
#[derive(Debug)]
pub enum Fetch<'a> {
    Chunk(ChunkRef<'a>),
    EndOfResultset,
}

/// Client-side consumer of one resultset.
#[derive(Debug)]
pub struct ResultsetReader {
    set: Arc<ResultsetSet>,
    index: u32,
    finished: bool,
}

enum Found {
    Chunk {
        wire: u32,
        offset: usize,
        len: usize,
        sequence: u64,
    },
    End,
}

impl ResultsetReader {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Wait for the next chunk in sequence, or end-of-resultset. The returned
    /// chunk borrows the reader, so it must be disposed (or dropped) before
    /// the next fetch. Fetching past end-of-resultset is an error.
    pub fn fetch(&mut self) -> Result<Fetch<'_>> {
        if self.finished {
            return Err(TgError::ResultsetExhausted { index: self.index });
        }

        let set = self.set.clone();
        let header = set.header()?;
        let entry = set.entry(self.index)?;
        let index = self.index;

        let found = shm::wait_until(&header.notify, &set.policy(), || {
            set.check_shutdown()?;
            let wanted = entry.next_read_seq.load(Ordering::Acquire);
            for (wire_index, wire) in set.wires()?.iter().enumerate() {
                let state = wire.state.load(Ordering::Acquire);
                if !matches!(state, WRITING | RELEASED)
                    || wire.resultset.load(Ordering::Acquire) != index
                {
                    continue;
                }
                let tail = wire.tail.load(Ordering::Relaxed);
                if tail >= wire.head.load(Ordering::Acquire) {
                    continue;
                }
                let offset = set.chunk_offset(wire_index as u32, tail);
                let mut chunk_header = [0u8; CHUNK_HEADER_LEN];
                set.segment.read_bytes(offset, &mut chunk_header)?;
                let sequence = u64::from_le_bytes(chunk_header[0..8].try_into().map_err(|_| {
                    TgError::MalformedFrame {
                        message: "truncated chunk header".to_string(),
                    }
                })?);
                if sequence != wanted {
                    continue;
                }
                let len = u32::from_le_bytes([
                    chunk_header[8],
                    chunk_header[9],
                    chunk_header[10],
                    chunk_header[11],
                ]) as usize;
                if len > set.geometry.chunk_payload as usize {
                    return Err(TgError::MalformedFrame {
                        message: format!("chunk length {} exceeds capacity", len),
                    });
                }
                return Ok(Some(Found::Chunk {
                    wire: wire_index as u32,
                    offset: offset + CHUNK_HEADER_LEN,
                    len,
                    sequence,
                }));
            }
            if entry.eor.load(Ordering::SeqCst) != 0
                && wanted == entry.next_write_seq.load(Ordering::SeqCst)
            {
                return Ok(Some(Found::End));
            }
            Ok(None)
        })?;

        match found {
            Some(Found::Chunk {
                wire,
                offset,
                len,
                sequence,
            }) => Ok(Fetch::Chunk(ChunkRef {
                reader: self,
                wire,
                offset,
                len,
                sequence,
            })),
            Some(Found::End) => {
                self.finished = true;
                set.free_entry(index)?;
                Ok(Fetch::EndOfResultset)
            }
            None => Err(TgError::Other("fetch wait ended without a deadline".into())),
        }
    }

    fn dispose(&self, wire_index: u32) -> Result<()> {
        let set = &self.set;
        let wire = set.wire(wire_index)?;
        wire.tail.fetch_add(1, Ordering::AcqRel);
        set.entry(self.index)?
            .next_read_seq
            .fetch_add(1, Ordering::AcqRel);
        set.try_free_wire(wire_index)?;
        set.notify();
        Ok(())
    }
}

impl Drop for ResultsetReader {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let abandon = || -> Result<()> {
            let entry = self.set.entry(self.index)?;
            entry.abandoned.store(1, Ordering::SeqCst);
            self.set.notify();
            self.set.try_publish_eor(self.index)
        };
        if let Err(e) = abandon() {
            warn!("Failed to abandon resultset {}: {}", self.index, e);
        }
    }
}

/// One fetched chunk. Disposing (explicitly or by drop) hands the space back
/// to the writer.
#[derive(Debug)]
pub struct ChunkRef<'a> {
    reader: &'a mut ResultsetReader,
    wire: u32,
    offset: usize,
    len: usize,
    sequence: u64,
}

impl ChunkRef<'_> {
    pub fn data(&self) -> &[u8] {
        self.reader
            .set
            .segment
            .bytes(self.offset, self.len)
            .unwrap_or(&[])
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn dispose(self) {}
}

impl Drop for ChunkRef<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.reader.dispose(self.wire) {
            warn!("Failed to dispose chunk {}: {}", self.sequence, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::AlwaysAlive;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn geometry(wire_count: u32) -> ResultsetGeometry {
        ResultsetGeometry {
            wire_count,
            chunk_count: 2,
            chunk_payload: 32,
        }
    }

    fn pair(dir: &TempDir, wire_count: u32) -> (Arc<ResultsetSet>, Arc<ResultsetSet>) {
        let path = dir.path().join("db-1-rs");
        let server =
            ResultsetSet::create(&path, geometry(wire_count), 1, Arc::new(AlwaysAlive)).unwrap();
        let client = ResultsetSet::open(&path, 1, Arc::new(AlwaysAlive)).unwrap();
        (server, client)
    }

    fn drain(reader: &mut ResultsetReader) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        loop {
            match reader.fetch().unwrap() {
                Fetch::Chunk(chunk) => {
                    chunks.push(chunk.data().to_vec());
                    chunk.dispose();
                }
                Fetch::EndOfResultset => return chunks,
            }
        }
    }

    #[test]
    fn test_chunks_arrive_in_order_then_eor() {
        let dir = TempDir::new().unwrap();
        let (server, client) = pair(&dir, 2);
        let mut handle = server.open_resultset().unwrap();
        let mut reader = client.reader(handle.index()).unwrap();

        let producer = std::thread::spawn(move || {
            let mut writer = handle.acquire_writer().unwrap();
            for i in 0..10 {
                writer.write(format!("row-{}", i).as_bytes()).unwrap();
                writer.flush().unwrap();
            }
            writer.release().unwrap();
            handle.close().unwrap();
        });

        let chunks = drain(&mut reader);
        producer.join().unwrap();

        let expected: Vec<Vec<u8>> = (0..10).map(|i| format!("row-{}", i).into_bytes()).collect();
        assert_eq!(chunks, expected);
        assert!(matches!(
            reader.fetch(),
            Err(TgError::ResultsetExhausted { .. })
        ));
    }

    #[test]
    fn test_large_write_is_split_into_full_chunks() {
        let dir = TempDir::new().unwrap();
        let (server, client) = pair(&dir, 1);
        let mut handle = server.open_resultset().unwrap();
        let mut reader = client.reader(handle.index()).unwrap();
        let payload: Vec<u8> = (0..200u8).collect();

        let producer = {
            let payload = payload.clone();
            std::thread::spawn(move || {
                let mut writer = handle.acquire_writer().unwrap();
                writer.write(&payload).unwrap();
                writer.release().unwrap();
                handle.close().unwrap();
            })
        };

        let chunks = drain(&mut reader);
        producer.join().unwrap();
        assert_eq!(chunks.len(), 7);
        assert!(chunks[..6].iter().all(|c| c.len() == 32));
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn test_empty_resultset_reports_eor_once() {
        let dir = TempDir::new().unwrap();
        let (server, client) = pair(&dir, 1);
        let mut handle = server.open_resultset().unwrap();
        let mut reader = client.reader(handle.index()).unwrap();
        handle.close().unwrap();

        assert!(matches!(reader.fetch().unwrap(), Fetch::EndOfResultset));
        assert!(reader.fetch().is_err());
    }

    #[test]
    fn test_eor_waits_for_writers() {
        let dir = TempDir::new().unwrap();
        let (server, client) = pair(&dir, 2);
        let mut handle = server.open_resultset().unwrap();
        let mut reader = client.reader(handle.index()).unwrap();

        let mut writer = handle.acquire_writer().unwrap();
        handle.close().unwrap();
        writer.write(b"late").unwrap();
        writer.flush().unwrap();

        match reader.fetch().unwrap() {
            Fetch::Chunk(chunk) => assert_eq!(chunk.data(), b"late"),
            Fetch::EndOfResultset => panic!("end reported while a writer was assigned"),
        }
        writer.release().unwrap();
        assert!(matches!(reader.fetch().unwrap(), Fetch::EndOfResultset));
    }

    #[test]
    fn test_writer_wires_are_bounded() {
        let dir = TempDir::new().unwrap();
        let (server, _client) = pair(&dir, 2);
        let handle = Arc::new(server.open_resultset().unwrap());

        let first = handle.acquire_writer().unwrap();
        let second = handle.acquire_writer().unwrap();
        assert_eq!(server.active_writers(), 2);

        let (tx, rx) = mpsc::channel();
        let blocked = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                let third = handle.acquire_writer().unwrap();
                tx.send(third.wire_index()).unwrap();
                third.release().unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(server.active_writers() <= 2);
        let freed = first.wire_index();
        first.release().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), freed);
        blocked.join().unwrap();
        second.release().unwrap();
        assert_eq!(server.active_writers(), 0);
    }

    #[test]
    fn test_multiple_writers_interleave_by_sequence() {
        let dir = TempDir::new().unwrap();
        let (server, client) = pair(&dir, 2);
        let mut handle = server.open_resultset().unwrap();
        let mut reader = client.reader(handle.index()).unwrap();

        let mut a = handle.acquire_writer().unwrap();
        let mut b = handle.acquire_writer().unwrap();
        a.write(b"a0").unwrap();
        a.flush().unwrap();
        b.write(b"b1").unwrap();
        b.flush().unwrap();
        a.write(b"a2").unwrap();
        a.flush().unwrap();
        a.release().unwrap();
        b.release().unwrap();
        handle.close().unwrap();

        let chunks = drain(&mut reader);
        assert_eq!(chunks, vec![b"a0".to_vec(), b"b1".to_vec(), b"a2".to_vec()]);
    }

    #[test]
    fn test_abandoned_resultset_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let (server, client) = pair(&dir, 1);
        let mut handle = server.open_resultset().unwrap();
        let index = handle.index();

        let mut writer = handle.acquire_writer().unwrap();
        writer.write(b"unread").unwrap();
        writer.flush().unwrap();
        drop(client.reader(index).unwrap());

        writer.release().unwrap();
        handle.close().unwrap();
        drop(handle);

        // The only entry and wire are free again.
        let mut next = server.open_resultset().unwrap();
        assert_eq!(next.index(), index);
        let w = next.acquire_writer().unwrap();
        w.release().unwrap();
        next.close().unwrap();
    }
}

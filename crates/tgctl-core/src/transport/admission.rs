//! Connection admission queue.
//!
//! A fixed pool of connection slots in the segment `<shm_dir>/<database>`.
//! Slot lifecycle:
//!
//! ```text
//! FREE -(client CAS)-> CLAIMED -> REQUESTED -(server)-> ACCEPTED -(client)-> IN_USE -(server)-> FREE
//!                                           \-(server)-> REJECTED -(client)-> FREE
//! ```
//!
//! Clients block while every slot is taken, which bounds the number of
//! concurrent sessions. The server's [`AdmissionQueue::listen`] serves
//! requests in ticket order and wakes periodically to observe the terminate
//! flag and its cancellation token.

#![allow(unsafe_code)]

use crate::cancel::CancellationToken;
use crate::config::TransportConfig;
use crate::error::{Result, TgError};
use crate::platform;
use crate::shm::{self, magic, Liveness, SharedLayout, SharedSegment, WaitPolicy, LAYOUT_VERSION};
use crate::transport::protocol::DiagnosticCode;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[repr(C)]
struct AdmissionHeader {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU32,
    server_pid: AtomicU32,
    terminate: AtomicU32,
    notify: AtomicU32,
    next_session_id: AtomicU64,
    next_ticket: AtomicU64,
}

#[repr(C)]
struct ConnectionSlot {
    state: AtomicU32,
    client_pid: AtomicU32,
    ticket: AtomicU64,
    session_id: AtomicU64,
}

// SAFETY: repr(C), atomics only.
unsafe impl SharedLayout for AdmissionHeader {}
// SAFETY: repr(C), atomics only.
unsafe impl SharedLayout for ConnectionSlot {}

const FREE: u32 = 0;
const CLAIMED: u32 = 1;
const REQUESTED: u32 = 2;
const ACCEPTED: u32 = 3;
const IN_USE: u32 = 4;
const REJECTED: u32 = 5;

const SLOTS_OFFSET: usize = size_of::<AdmissionHeader>();

/// A connection request picked up by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConnection {
    pub slot: u32,
    pub client_pid: u32,
    pub ticket: u64,
}

/// Outcome of a successful client admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub slot: u32,
    pub session_id: u64,
}

/// Handle on the admission segment.
#[derive(Debug)]
pub struct AdmissionQueue {
    segment: SharedSegment,
    capacity: u32,
}

impl AdmissionQueue {
    /// Create the queue with `capacity` slots (server side).
    pub fn create(path: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        let capacity = capacity.max(1);
        let len = SLOTS_OFFSET + capacity as usize * size_of::<ConnectionSlot>();
        let segment = SharedSegment::create(path, len)?;
        let header: &AdmissionHeader = segment.view(0)?;

        header.capacity.store(capacity, Ordering::Relaxed);
        header
            .server_pid
            .store(platform::current_pid(), Ordering::Relaxed);
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.magic.store(magic::ADMISSION, Ordering::Release);

        info!(
            "Admission queue {} open with {} slots",
            segment.path().display(),
            capacity
        );
        Ok(Self { segment, capacity })
    }

    /// Map an existing queue (client side).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let segment = SharedSegment::open(path)?;
        let header: &AdmissionHeader = segment.view(0)?;
        let found = header.magic.load(Ordering::Acquire);
        if found != magic::ADMISSION || header.version.load(Ordering::Relaxed) != LAYOUT_VERSION {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: format!("not an admission queue (magic {:#x})", found),
            });
        }
        let capacity = header.capacity.load(Ordering::Relaxed);
        // Validates that the slot array fits.
        segment.view_slice::<ConnectionSlot>(SLOTS_OFFSET, capacity as usize)?;
        Ok(Self { segment, capacity })
    }

    pub fn remove(path: impl AsRef<Path>) -> Result<bool> {
        SharedSegment::remove(path)
    }

    fn header(&self) -> Result<&AdmissionHeader> {
        self.segment.view(0)
    }

    fn slots(&self) -> Result<&[ConnectionSlot]> {
        self.segment
            .view_slice(SLOTS_OFFSET, self.capacity as usize)
    }

    fn slot(&self, index: u32) -> Result<&ConnectionSlot> {
        self.slots()?
            .get(index as usize)
            .ok_or_else(|| TgError::Validation {
                field: "slot".to_string(),
                message: format!("slot {} out of range", index),
            })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn server_pid(&self) -> u32 {
        self.header()
            .map(|h| h.server_pid.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_terminated(&self) -> bool {
        self.header()
            .map(|h| h.terminate.load(Ordering::Acquire) != 0)
            .unwrap_or(true)
    }

    /// Slots not currently free.
    pub fn occupied(&self) -> usize {
        self.slots()
            .map(|slots| {
                slots
                    .iter()
                    .filter(|s| s.state.load(Ordering::Acquire) != FREE)
                    .count()
            })
            .unwrap_or(0)
    }

    fn terminated_error() -> TgError {
        TgError::transport(
            DiagnosticCode::ServiceUnavailable,
            "server is no longer accepting connections",
        )
    }

    // ----- client side -----

    /// Request admission, blocking while the pool is exhausted and until the
    /// server answers.
    pub fn connect(&self, liveness: &dyn Liveness, timeout: Option<Duration>) -> Result<Admission> {
        let header = self.header()?;
        let started = Instant::now();
        let policy = WaitPolicy::new(TransportConfig::WAIT_QUANTUM, liveness).with_timeout(timeout);
        let timed_out = || TgError::Timeout(started.elapsed());

        let (index, slot) = loop {
            let index = shm::wait_until(&header.notify, &policy, || {
                if self.is_terminated() {
                    return Err(Self::terminated_error());
                }
                for (index, slot) in self.slots()?.iter().enumerate() {
                    if slot
                        .state
                        .compare_exchange(FREE, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(Some(index as u32));
                    }
                }
                Ok(None)
            })?
            .ok_or_else(timed_out)?;

            let slot = self.slot(index)?;
            slot.client_pid
                .store(platform::current_pid(), Ordering::Release);
            slot.session_id.store(0, Ordering::Relaxed);
            let ticket = header.next_ticket.fetch_add(1, Ordering::AcqRel);
            slot.ticket.store(ticket, Ordering::Relaxed);
            if slot
                .state
                .compare_exchange(CLAIMED, REQUESTED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                shm::notify_all(&header.notify);
                debug!("Requested admission in slot {} (ticket {})", index, ticket);
                break (index, slot);
            }
            warn!("Lost claim on admission slot {}; retrying", index);
        };

        let answer = shm::wait_until(&header.notify, &policy, || {
            match slot.state.load(Ordering::Acquire) {
                ACCEPTED | REJECTED => Ok(Some(())),
                _ if self.is_terminated() => Err(Self::terminated_error()),
                _ => Ok(None),
            }
        });

        match answer {
            Ok(Some(())) => self.finish_connect(index),
            Ok(None) => {
                if self.withdraw(index) {
                    Err(timed_out())
                } else {
                    self.finish_connect(index)
                }
            }
            Err(e) => {
                if !self.withdraw(index) {
                    let _ = self.finish_connect(index);
                }
                Err(e)
            }
        }
    }

    fn finish_connect(&self, index: u32) -> Result<Admission> {
        let header = self.header()?;
        let slot = self.slot(index)?;
        match slot.state.load(Ordering::Acquire) {
            ACCEPTED => {
                let session_id = slot.session_id.load(Ordering::Acquire);
                if slot
                    .state
                    .compare_exchange(ACCEPTED, IN_USE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(TgError::Other(format!(
                        "admission slot {} released before session {} started",
                        index, session_id
                    )));
                }
                shm::notify_all(&header.notify);
                info!("Admitted as session {} (slot {})", session_id, index);
                Ok(Admission {
                    slot: index,
                    session_id,
                })
            }
            REJECTED => {
                slot.client_pid.store(0, Ordering::Release);
                slot.state.store(FREE, Ordering::Release);
                shm::notify_all(&header.notify);
                Err(TgError::ConnectionRejected)
            }
            other => Err(TgError::Other(format!(
                "admission slot {} in unexpected state {}",
                index, other
            ))),
        }
    }

    /// Take back an unanswered request. Fails if the server answered first.
    fn withdraw(&self, index: u32) -> bool {
        let Ok(slot) = self.slot(index) else {
            return false;
        };
        // Back through CLAIMED so the pid is cleared before the slot is free.
        let withdrawn = slot
            .state
            .compare_exchange(REQUESTED, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if withdrawn {
            slot.client_pid.store(0, Ordering::Release);
            slot.state.store(FREE, Ordering::Release);
            if let Ok(header) = self.header() {
                shm::notify_all(&header.notify);
            }
        }
        withdrawn
    }

    // ----- server side -----

    /// Wait for the next connection request. Returns `Ok(None)` once the
    /// queue is terminated or `cancel` fires.
    pub fn listen(&self, cancel: &CancellationToken) -> Result<Option<PendingConnection>> {
        let header = self.header()?;
        let policy = WaitPolicy::new(TransportConfig::WAIT_QUANTUM, &shm::AlwaysAlive);
        let mut last_sweep = Instant::now();

        loop {
            if cancel.is_cancelled() || self.is_terminated() {
                return Ok(None);
            }

            if last_sweep.elapsed() >= TransportConfig::WAIT_QUANTUM {
                self.reclaim_abandoned()?;
                last_sweep = Instant::now();
            }

            let round = policy.with_timeout(Some(TransportConfig::WAIT_QUANTUM));
            let next = shm::wait_until(&header.notify, &round, || self.oldest_request())?;
            if let Some(pending) = next {
                debug!(
                    "Connection request in slot {} from pid {} (ticket {})",
                    pending.slot, pending.client_pid, pending.ticket
                );
                return Ok(Some(pending));
            }
        }
    }

    fn oldest_request(&self) -> Result<Option<PendingConnection>> {
        let mut oldest: Option<PendingConnection> = None;
        for (index, slot) in self.slots()?.iter().enumerate() {
            if slot.state.load(Ordering::Acquire) != REQUESTED {
                continue;
            }
            let candidate = PendingConnection {
                slot: index as u32,
                client_pid: slot.client_pid.load(Ordering::Relaxed),
                ticket: slot.ticket.load(Ordering::Relaxed),
            };
            if oldest.map_or(true, |o| candidate.ticket < o.ticket) {
                oldest = Some(candidate);
            }
        }
        Ok(oldest)
    }

    /// Free slots whose client died before the session was established.
    ///
    /// A slot's pid is zero from the moment it is freed until its next
    /// claimant stores its own, so a fresh claim is never mistaken for the
    /// dead previous owner.
    fn reclaim_abandoned(&self) -> Result<()> {
        let header = self.header()?;
        for (index, slot) in self.slots()?.iter().enumerate() {
            if !matches!(slot.state.load(Ordering::Acquire), CLAIMED | REQUESTED | REJECTED) {
                continue;
            }
            let pid = slot.client_pid.load(Ordering::Acquire);
            if pid == 0 || platform::is_process_alive(pid) {
                continue;
            }
            // Clearing the pid takes the right to reclaim.
            if slot
                .client_pid
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            loop {
                let state = slot.state.load(Ordering::Acquire);
                if !matches!(state, CLAIMED | REQUESTED | REJECTED) {
                    break;
                }
                if slot
                    .state
                    .compare_exchange(state, FREE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    warn!("Reclaimed admission slot {} from dead pid {}", index, pid);
                    shm::notify_all(&header.notify);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Allocate the next session id.
    pub fn next_session_id(&self) -> Result<u64> {
        Ok(self.header()?.next_session_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Publish acceptance. The session wire must already exist.
    pub fn accept(&self, pending: &PendingConnection, session_id: u64) -> Result<bool> {
        let header = self.header()?;
        let slot = self.slot(pending.slot)?;
        slot.session_id.store(session_id, Ordering::Release);
        let accepted = slot
            .state
            .compare_exchange(REQUESTED, ACCEPTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        shm::notify_all(&header.notify);
        if !accepted {
            debug!("Connection request in slot {} was withdrawn", pending.slot);
        }
        Ok(accepted)
    }

    pub fn reject(&self, pending: &PendingConnection) -> Result<()> {
        let header = self.header()?;
        let slot = self.slot(pending.slot)?;
        let _ = slot.state.compare_exchange(
            REQUESTED,
            REJECTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        shm::notify_all(&header.notify);
        Ok(())
    }

    /// Return a session's slot to the pool. Only frees the slot if it still
    /// belongs to `session_id`.
    pub fn release(&self, index: u32, session_id: u64) -> Result<bool> {
        let header = self.header()?;
        let slot = self.slot(index)?;
        if slot.session_id.load(Ordering::Acquire) != session_id {
            return Ok(false);
        }
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if !matches!(state, IN_USE | ACCEPTED) {
                return Ok(false);
            }
            slot.client_pid.store(0, Ordering::Release);
            if slot
                .state
                .compare_exchange(state, FREE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                shm::notify_all(&header.notify);
                return Ok(true);
            }
        }
    }

    /// Stop admitting. Blocked clients and the listener wake and give up.
    pub fn terminate(&self) -> Result<()> {
        let header = self.header()?;
        header.terminate.store(1, Ordering::Release);
        shm::notify_all(&header.notify);
        info!("Admission queue {} terminated", self.segment.path().display());
        Ok(())
    }
}

//! Session wire: the per-session segment holding both frame rings.
//!
//! ```text
//! [WireHeader][request ring][response ring]
//! ```
//!
//! The header publishes the geometry (so the client can map the rings
//! without out-of-band configuration), both peers' PIDs, the session state
//! and the expiration window and deadline used by keep-alive.

#![allow(unsafe_code)]

use super::ring::{FrameRing, RingGeometry};
use crate::error::{Result, TgError};
use crate::platform;
use crate::shm::{self, align_up, magic, Liveness, SharedLayout, SharedSegment, LAYOUT_VERSION};
use crate::status::StatusBlock;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[repr(C)]
struct WireHeader {
    magic: AtomicU32,
    version: AtomicU32,
    slot_count: AtomicU32,
    frame_count: AtomicU32,
    frame_payload: AtomicU32,
    server_pid: AtomicU32,
    client_pid: AtomicU32,
    state: AtomicU32,
    session_id: AtomicU64,
    expiration_window_ms: AtomicU64,
    expiration_deadline_ms: AtomicU64,
    notify: AtomicU32,
    _reserved: u32,
}

// SAFETY: repr(C), atomics and plain integers only.
unsafe impl SharedLayout for WireHeader {}

const WIRE_HEADER_LEN: usize = align_up(size_of::<WireHeader>(), 64);

/// Session wire geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireGeometry {
    /// Number of correlation slots (K).
    pub slot_count: u32,
    pub frame_count: u32,
    pub frame_payload: u32,
}

impl WireGeometry {
    fn ring(&self) -> RingGeometry {
        RingGeometry {
            frame_count: self.frame_count,
            frame_payload: self.frame_payload,
        }
    }

    pub fn segment_size(&self) -> usize {
        WIRE_HEADER_LEN + 2 * self.ring().size()
    }
}

/// Session state published in the wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WireState {
    Open = 1,
    ClientClosed = 2,
    ServerClosed = 3,
    Expired = 4,
}

impl WireState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(WireState::Open),
            2 => Some(WireState::ClientClosed),
            3 => Some(WireState::ServerClosed),
            4 => Some(WireState::Expired),
            _ => None,
        }
    }
}

/// Milliseconds since the Unix epoch, the clock shared by both peers.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Handle on a mapped session wire.
#[derive(Debug)]
pub struct SessionWire {
    segment: Arc<SharedSegment>,
    session_id: u64,
    geometry: WireGeometry,
    requests: FrameRing,
    responses: FrameRing,
}

impl SessionWire {
    /// Create a wire for `session_id` (server side).
    pub fn create(
        path: impl AsRef<Path>,
        session_id: u64,
        geometry: WireGeometry,
        expiration: Duration,
    ) -> Result<Self> {
        let segment = Arc::new(SharedSegment::create(path, geometry.segment_size())?);
        let header: &WireHeader = segment.view(0)?;

        header.slot_count.store(geometry.slot_count, Ordering::Relaxed);
        header.frame_count.store(geometry.frame_count, Ordering::Relaxed);
        header
            .frame_payload
            .store(geometry.frame_payload, Ordering::Relaxed);
        header
            .server_pid
            .store(platform::current_pid(), Ordering::Relaxed);
        header.session_id.store(session_id, Ordering::Relaxed);
        let window = expiration.as_millis() as u64;
        header.expiration_window_ms.store(window, Ordering::Relaxed);
        header
            .expiration_deadline_ms
            .store(now_ms() + window, Ordering::Relaxed);
        header.state.store(WireState::Open as u32, Ordering::Relaxed);
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.magic.store(magic::WIRE, Ordering::Release);

        debug!(
            "Created session wire {} for session {}",
            segment.path().display(),
            session_id
        );
        Self::bind(segment, session_id, geometry)
    }

    /// Map an existing wire (client side).
    pub fn open(path: impl AsRef<Path>, session_id: u64) -> Result<Self> {
        let segment = Arc::new(SharedSegment::open(path)?);
        let header: &WireHeader = segment.view(0)?;

        let found = header.magic.load(Ordering::Acquire);
        if found != magic::WIRE || header.version.load(Ordering::Relaxed) != LAYOUT_VERSION {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: format!("not a session wire (magic {:#x})", found),
            });
        }
        let published = header.session_id.load(Ordering::Relaxed);
        if published != session_id {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: format!("wire belongs to session {}", published),
            });
        }

        let geometry = WireGeometry {
            slot_count: header.slot_count.load(Ordering::Relaxed),
            frame_count: header.frame_count.load(Ordering::Relaxed),
            frame_payload: header.frame_payload.load(Ordering::Relaxed),
        };
        if geometry.segment_size() > segment.len() {
            return Err(TgError::InvalidSegment {
                path: segment.path().to_path_buf(),
                message: "published geometry exceeds segment".to_string(),
            });
        }
        Self::bind(segment, session_id, geometry)
    }

    fn bind(segment: Arc<SharedSegment>, session_id: u64, geometry: WireGeometry) -> Result<Self> {
        let ring = geometry.ring();
        let requests = FrameRing::new(segment.clone(), WIRE_HEADER_LEN, ring, session_id)?;
        let responses = FrameRing::new(
            segment.clone(),
            WIRE_HEADER_LEN + ring.size(),
            ring,
            session_id,
        )?;
        Ok(Self {
            segment,
            session_id,
            geometry,
            requests,
            responses,
        })
    }

    pub fn remove(path: impl AsRef<Path>) -> Result<bool> {
        SharedSegment::remove(path)
    }

    fn header(&self) -> Result<&WireHeader> {
        self.segment.view(0)
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn geometry(&self) -> WireGeometry {
        self.geometry
    }

    /// Client-to-server ring.
    pub fn requests(&self) -> &FrameRing {
        &self.requests
    }

    /// Server-to-client ring.
    pub fn responses(&self) -> &FrameRing {
        &self.responses
    }

    pub fn server_pid(&self) -> u32 {
        self.header()
            .map(|h| h.server_pid.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn client_pid(&self) -> u32 {
        self.header()
            .map(|h| h.client_pid.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Publish the attaching client's PID.
    pub fn register_client(&self) -> Result<()> {
        let header = self.header()?;
        header
            .client_pid
            .store(platform::current_pid(), Ordering::Release);
        shm::notify_all(&header.notify);
        Ok(())
    }

    pub fn state(&self) -> Option<WireState> {
        self.header()
            .ok()
            .and_then(|h| WireState::from_raw(h.state.load(Ordering::Acquire)))
    }

    pub fn is_open(&self) -> bool {
        self.state() == Some(WireState::Open)
    }

    /// Close the session from one side. The first close wins; both rings are
    /// closed so blocked peers wake up.
    pub fn close(&self, reason: WireState) -> Result<()> {
        let header = self.header()?;
        let _ = header.state.compare_exchange(
            WireState::Open as u32,
            reason as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.requests.close()?;
        self.responses.close()?;
        shm::notify_all(&header.notify);
        Ok(())
    }

    pub fn expiration_window(&self) -> Duration {
        Duration::from_millis(
            self.header()
                .map(|h| h.expiration_window_ms.load(Ordering::Acquire))
                .unwrap_or(0),
        )
    }

    pub fn expiration_deadline_ms(&self) -> u64 {
        self.header()
            .map(|h| h.expiration_deadline_ms.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Push the deadline one window past `now`. Returns the new deadline.
    pub fn extend_expiration(&self, now: u64) -> Result<u64> {
        let header = self.header()?;
        let window = header.expiration_window_ms.load(Ordering::Acquire);
        let deadline = now + window;
        header
            .expiration_deadline_ms
            .fetch_max(deadline, Ordering::AcqRel);
        Ok(deadline)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiration_deadline_ms()
    }

    /// Time left before expiration as seen at `now`.
    pub fn remaining(&self, now: u64) -> Duration {
        Duration::from_millis(self.expiration_deadline_ms().saturating_sub(now))
    }
}

/// Liveness of the other end of a wire: the session must be open, the peer
/// process alive and, for clients, the server's status block not terminal.
pub struct PeerWatch<'a> {
    wire: &'a SessionWire,
    peer_pid: u32,
    status: Option<&'a StatusBlock>,
}

impl<'a> PeerWatch<'a> {
    /// Watch the server from the client side.
    pub fn server(wire: &'a SessionWire, status: Option<&'a StatusBlock>) -> Self {
        Self {
            wire,
            peer_pid: wire.server_pid(),
            status,
        }
    }

    /// Watch the client from the server side.
    pub fn client(wire: &'a SessionWire) -> Self {
        Self {
            wire,
            peer_pid: wire.client_pid(),
            status: None,
        }
    }
}

impl Liveness for PeerWatch<'_> {
    fn ensure_alive(&self) -> Result<()> {
        if !self.wire.is_open() {
            return Err(TgError::SessionClosed {
                session_id: self.wire.session_id(),
            });
        }
        // A client that has not registered yet has PID 0.
        if self.peer_pid != 0 && !platform::is_process_alive(self.peer_pid) {
            return Err(TgError::PeerDied {
                message: format!(
                    "peer {} of session {} exited",
                    self.peer_pid,
                    self.wire.session_id()
                ),
            });
        }
        if let Some(status) = self.status {
            status.ensure_alive()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{AlwaysAlive, WaitPolicy};
    use crate::transport::protocol::FrameKind;
    use tempfile::TempDir;

    fn geometry() -> WireGeometry {
        WireGeometry {
            slot_count: 4,
            frame_count: 8,
            frame_payload: 64,
        }
    }

    fn policy() -> WaitPolicy<'static> {
        WaitPolicy::new(Duration::from_millis(20), &AlwaysAlive)
            .with_timeout(Some(Duration::from_secs(10)))
    }

    #[test]
    fn test_client_sees_published_geometry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-1");
        let server = SessionWire::create(&path, 1, geometry(), Duration::from_secs(60)).unwrap();
        let client = SessionWire::open(&path, 1).unwrap();

        assert_eq!(client.geometry(), geometry());
        assert_eq!(client.server_pid(), platform::current_pid());
        assert_eq!(client.expiration_window(), Duration::from_secs(60));
        assert!(client.is_open());

        client.register_client().unwrap();
        assert_eq!(server.client_pid(), platform::current_pid());
    }

    #[test]
    fn test_open_rejects_wrong_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-1");
        let _server = SessionWire::create(&path, 1, geometry(), Duration::from_secs(60)).unwrap();
        assert!(SessionWire::open(&path, 2).is_err());
    }

    #[test]
    fn test_request_response_keep_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-1");
        let server = SessionWire::create(&path, 1, geometry(), Duration::from_secs(60)).unwrap();
        let client = SessionWire::open(&path, 1).unwrap();

        client
            .requests()
            .write_message(2, FrameKind::Request, b"ping", &policy())
            .unwrap();
        let request = server.requests().read_message(&policy()).unwrap().unwrap();
        server
            .responses()
            .write_message(request.slot, FrameKind::Response, b"pong", &policy())
            .unwrap();
        let response = client.responses().read_message(&policy()).unwrap().unwrap();

        assert_eq!(response.slot, 2);
        assert_eq!(response.payload, b"pong");
    }

    #[test]
    fn test_expiration_extends() {
        let dir = TempDir::new().unwrap();
        let wire = SessionWire::create(
            dir.path().join("db-1"),
            1,
            geometry(),
            Duration::from_millis(1000),
        )
        .unwrap();

        let now = now_ms();
        assert!(!wire.is_expired(now));
        assert!(wire.is_expired(now + 5_000));
        wire.extend_expiration(now + 4_500).unwrap();
        assert!(!wire.is_expired(now + 5_000));
    }

    #[test]
    fn test_close_wakes_peer_watch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-1");
        let server = SessionWire::create(&path, 1, geometry(), Duration::from_secs(60)).unwrap();
        let client = SessionWire::open(&path, 1).unwrap();

        assert!(PeerWatch::server(&client, None).ensure_alive().is_ok());
        server.close(WireState::ServerClosed).unwrap();
        assert!(matches!(
            PeerWatch::server(&client, None).ensure_alive(),
            Err(TgError::SessionClosed { session_id: 1 })
        ));
        client.close(WireState::ClientClosed).unwrap();
        assert_eq!(client.state(), Some(WireState::ServerClosed));
    }
}

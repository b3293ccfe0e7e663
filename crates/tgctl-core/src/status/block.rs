//! Shared-memory status block.

#![allow(unsafe_code)]

use super::lifecycle::{LifecycleState, ShutdownRequest};
use crate::error::{Result, TgError};
use crate::platform;
use crate::shm::{self, magic, Liveness, SharedLayout, SharedSegment, WaitPolicy, LAYOUT_VERSION};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[repr(C)]
struct StatusHeader {
    magic: AtomicU32,
    version: AtomicU32,
    owner_pid: AtomicU32,
    state: AtomicU32,
    shutdown: AtomicU32,
    notify: AtomicU32,
}

// SAFETY: repr(C), atomics only.
unsafe impl SharedLayout for StatusHeader {}

/// Point-in-time reading of a status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub owner_pid: u32,
    /// `None` while the owner has not yet published a state.
    pub state: Option<LifecycleState>,
    pub shutdown: ShutdownRequest,
}

/// Result of reading a status segment by path. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusProbe {
    /// No segment at the path.
    Missing,
    /// Segment exists but its header has not been published yet.
    Uninitialized,
    /// Segment exists but is not a status block of this layout.
    Invalid(String),
    Present(StatusSnapshot),
}

/// Handle on a status segment.
///
/// The creating handle owns the lifecycle state; attached handles may only
/// read and place a shutdown request.
#[derive(Debug)]
pub struct StatusBlock {
    segment: SharedSegment,
    owner: bool,
}

impl StatusBlock {
    /// Create the block for the calling process in state `Initial`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let segment = SharedSegment::create(path, std::mem::size_of::<StatusHeader>())?;
        let header: &StatusHeader = segment.view(0)?;

        header.owner_pid.store(platform::current_pid(), Ordering::Relaxed);
        header
            .state
            .store(LifecycleState::Initial.as_raw(), Ordering::Relaxed);
        header
            .shutdown
            .store(ShutdownRequest::None.as_raw(), Ordering::Relaxed);
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        // Magic last: attachers treat a zero magic as "not yet published".
        header.magic.store(magic::STATUS, Ordering::Release);

        info!(
            "Created status block {} (state {})",
            segment.path().display(),
            LifecycleState::Initial
        );
        Ok(Self {
            segment,
            owner: true,
        })
    }

    /// Attach to an existing, published status block.
    pub fn attach(path: impl AsRef<Path>) -> Result<Self> {
        let segment = SharedSegment::open(path)?;
        validate_header(&segment)?;
        Ok(Self {
            segment,
            owner: false,
        })
    }

    /// Read a status segment without raising.
    pub fn probe(path: impl AsRef<Path>) -> StatusProbe {
        let path = path.as_ref();
        if !SharedSegment::exists(path) {
            return StatusProbe::Missing;
        }
        let segment = match SharedSegment::open(path) {
            Ok(segment) => segment,
            Err(TgError::Io { source: Some(e), .. })
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                return StatusProbe::Missing;
            }
            Err(e) => return StatusProbe::Invalid(e.to_string()),
        };
        match validate_header(&segment) {
            Ok(()) => {}
            Err(TgError::InvalidSegment { message, .. }) if message == NOT_PUBLISHED => {
                return StatusProbe::Uninitialized;
            }
            Err(e) => return StatusProbe::Invalid(e.to_string()),
        }
        let block = Self {
            segment,
            owner: false,
        };
        match block.header() {
            Ok(_) => StatusProbe::Present(block.snapshot()),
            Err(e) => StatusProbe::Invalid(e.to_string()),
        }
    }

    /// Remove a status segment directly. Returns `true` if it existed.
    pub fn destroy(path: impl AsRef<Path>) -> Result<bool> {
        let removed = SharedSegment::remove(path.as_ref())?;
        if removed {
            debug!("Destroyed status block {}", path.as_ref().display());
        }
        Ok(removed)
    }

    fn header(&self) -> Result<&StatusHeader> {
        self.segment.view(0)
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn owner_pid(&self) -> u32 {
        self.header()
            .map(|h| h.owner_pid.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn state(&self) -> Option<LifecycleState> {
        self.header()
            .ok()
            .and_then(|h| LifecycleState::from_raw(h.state.load(Ordering::Acquire)))
    }

    pub fn shutdown_request(&self) -> ShutdownRequest {
        self.header()
            .map(|h| ShutdownRequest::from_raw(h.shutdown.load(Ordering::Acquire)))
            .unwrap_or(ShutdownRequest::None)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            owner_pid: self.owner_pid(),
            state: self.state(),
            shutdown: self.shutdown_request(),
        }
    }

    /// Move the lifecycle forward. Only the creating handle may do this.
    pub fn advance(&self, next: LifecycleState) -> Result<()> {
        if !self.owner {
            return Err(TgError::Other(format!(
                "status block {} is attached read-only",
                self.path().display()
            )));
        }

        let header = self.header()?;
        let raw = header.state.load(Ordering::Acquire);
        let current = LifecycleState::from_raw(raw).unwrap_or(LifecycleState::Initial);
        if !current.can_advance_to(next) {
            return Err(TgError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        // Sole writer, so the exchange only guards against a corrupted segment.
        header
            .state
            .compare_exchange(raw, next.as_raw(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TgError::Other("status block state changed concurrently".into()))?;
        shm::notify_all(&header.notify);

        info!("Lifecycle {} -> {}", current, next);
        Ok(())
    }

    /// Place a one-shot shutdown request. Returns `false` if a request was
    /// already present, from any process.
    pub fn request_shutdown(&self, kind: ShutdownRequest) -> Result<bool> {
        if kind == ShutdownRequest::None {
            return Err(TgError::Validation {
                field: "shutdown".to_string(),
                message: "request kind must be graceful or forceful".to_string(),
            });
        }

        let header = self.header()?;
        let placed = header
            .shutdown
            .compare_exchange(
                ShutdownRequest::None.as_raw(),
                kind.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if placed {
            shm::notify_all(&header.notify);
            info!("Placed {} shutdown request on {}", kind, self.path().display());
        } else {
            debug!("Shutdown already requested on {}", self.path().display());
        }
        Ok(placed)
    }

    /// Block until a shutdown request is present or `timeout` elapses.
    pub fn wait_for_shutdown_request(&self, timeout: Duration) -> Result<Option<ShutdownRequest>> {
        let header = self.header()?;
        let policy = WaitPolicy::new(crate::config::TransportConfig::WAIT_QUANTUM, &shm::AlwaysAlive)
            .with_timeout(Some(timeout));
        shm::wait_until(&header.notify, &policy, || {
            let request = ShutdownRequest::from_raw(header.shutdown.load(Ordering::Acquire));
            Ok((request != ShutdownRequest::None).then_some(request))
        })
    }
}

const NOT_PUBLISHED: &str = "header not yet published";

fn validate_header(segment: &SharedSegment) -> Result<()> {
    let header: &StatusHeader = segment.view(0)?;
    let found = header.magic.load(Ordering::Acquire);
    if found == 0 {
        return Err(TgError::InvalidSegment {
            path: segment.path().to_path_buf(),
            message: NOT_PUBLISHED.to_string(),
        });
    }
    if found != magic::STATUS {
        return Err(TgError::InvalidSegment {
            path: segment.path().to_path_buf(),
            message: format!("bad magic {:#x}", found),
        });
    }
    let version = header.version.load(Ordering::Acquire);
    if version != LAYOUT_VERSION {
        warn!(
            "Status block {} has layout version {}",
            segment.path().display(),
            version
        );
        return Err(TgError::InvalidSegment {
            path: segment.path().to_path_buf(),
            message: format!("unsupported layout version {}", version),
        });
    }
    Ok(())
}

/// A client is talking to a live server while the owner process exists and
/// has not reached a terminal state.
impl Liveness for StatusBlock {
    fn ensure_alive(&self) -> Result<()> {
        let pid = self.owner_pid();
        if !platform::is_process_alive(pid) {
            return Err(TgError::PeerDied {
                message: format!("server process {} exited", pid),
            });
        }
        match self.state() {
            Some(state) if state.is_terminal() => Err(TgError::PeerDied {
                message: format!("server is {}", state),
            }),
            _ => Ok(()),
        }
    }
}

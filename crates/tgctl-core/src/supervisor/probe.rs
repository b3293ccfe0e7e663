//! Aggregate probe over the lock file and the status segment.

use crate::config::InstanceConfig;
use crate::lock::{AdvisoryLock, LockFile, LockState};
use crate::status::{LifecycleState, ShutdownRequest, StatusBlock, StatusProbe};
use serde::Serialize;
use std::fmt;

/// Server status as reported by `tgctl status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Inactive,
    Booting,
    Running,
    ShuttingDown,
    Unknown,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Inactive => "inactive",
            ServerStatus::Booting => "booting",
            ServerStatus::Running => "running",
            ServerStatus::ShuttingDown => "shutting_down",
            ServerStatus::Unknown => "unknown",
            ServerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the status segment looked like at probe time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "segment", rename_all = "snake_case")]
pub enum SegmentView {
    Missing,
    Uninitialized,
    Invalid {
        message: String,
    },
    Present {
        owner_pid: u32,
        state: Option<LifecycleState>,
        shutdown: ShutdownRequest,
    },
}

impl From<StatusProbe> for SegmentView {
    fn from(probe: StatusProbe) -> Self {
        match probe {
            StatusProbe::Missing => SegmentView::Missing,
            StatusProbe::Uninitialized => SegmentView::Uninitialized,
            StatusProbe::Invalid(message) => SegmentView::Invalid { message },
            StatusProbe::Present(snapshot) => SegmentView::Present {
                owner_pid: snapshot.owner_pid,
                state: snapshot.state,
                shutdown: snapshot.shutdown,
            },
        }
    }
}

/// One combined reading of both probes. Neither probe raises, so neither
/// does this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub lock: LockState,
    pub lock_owner: Option<u32>,
    pub segment: SegmentView,
}

impl ProbeReport {
    pub fn collect(config: &InstanceConfig) -> Self {
        let lock_file = LockFile::new(config.lock_file_path());
        let lock = lock_file.probe();
        let lock_owner = match lock {
            LockState::NoFile => None,
            _ => lock_file.owner(),
        };
        let segment = StatusBlock::probe(config.status_segment_path()).into();
        Self {
            lock,
            lock_owner,
            segment,
        }
    }

    pub fn lifecycle(&self) -> Option<LifecycleState> {
        match &self.segment {
            SegmentView::Present { state, .. } => *state,
            _ => None,
        }
    }

    /// The aggregate states from which a server may be started and in which
    /// a shutdown has nothing to do.
    pub fn is_down(&self) -> bool {
        matches!(self.lock, LockState::NoFile | LockState::NotLocked)
            || self.lifecycle() == Some(LifecycleState::Deactivated)
    }

    pub fn server_status(&self) -> ServerStatus {
        match self.lock {
            LockState::NoFile | LockState::NotLocked => ServerStatus::Inactive,
            LockState::Error => ServerStatus::Error,
            LockState::Locked => match &self.segment {
                SegmentView::Missing | SegmentView::Uninitialized => ServerStatus::Booting,
                SegmentView::Invalid { .. } => ServerStatus::Unknown,
                SegmentView::Present { state, .. } => match state {
                    None | Some(LifecycleState::Initial) | Some(LifecycleState::Ready) => {
                        ServerStatus::Booting
                    }
                    Some(LifecycleState::Activated) => ServerStatus::Running,
                    Some(LifecycleState::Deactivating) | Some(LifecycleState::Deactivated) => {
                        ServerStatus::ShuttingDown
                    }
                    Some(LifecycleState::BootError) => ServerStatus::Error,
                },
            },
        }
    }
}

//! Server lifecycle and shutdown-request enumerations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a server instance as published in its status block.
///
/// `Initial → Ready → Activated → Deactivating → Deactivated`, with the
/// terminal `BootError` reachable only from `Initial` or `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum LifecycleState {
    Initial = 1,
    Ready = 2,
    Activated = 3,
    Deactivating = 4,
    Deactivated = 5,
    BootError = 6,
}

impl LifecycleState {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decode a raw state word. Zero (a freshly created segment) and unknown
    /// values yield `None`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(LifecycleState::Initial),
            2 => Some(LifecycleState::Ready),
            3 => Some(LifecycleState::Activated),
            4 => Some(LifecycleState::Deactivating),
            5 => Some(LifecycleState::Deactivated),
            6 => Some(LifecycleState::BootError),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Deactivated | LifecycleState::BootError)
    }

    /// Whether `next` is a legal forward move from `self`.
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Initial | Ready, BootError) => true,
            (_, BootError) => false,
            (BootError | Deactivated, _) => false,
            (current, next) => next.as_raw() > current.as_raw(),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Initial => "initial",
            LifecycleState::Ready => "ready",
            LifecycleState::Activated => "activated",
            LifecycleState::Deactivating => "deactivating",
            LifecycleState::Deactivated => "deactivated",
            LifecycleState::BootError => "boot_error",
        };
        f.write_str(s)
    }
}

/// Value of the one-shot shutdown-request field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ShutdownRequest {
    None = 0,
    Graceful = 1,
    Forceful = 2,
}

impl ShutdownRequest {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ShutdownRequest::Graceful,
            2 => ShutdownRequest::Forceful,
            _ => ShutdownRequest::None,
        }
    }
}

impl fmt::Display for ShutdownRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownRequest::None => "none",
            ShutdownRequest::Graceful => "graceful",
            ShutdownRequest::Forceful => "forceful",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    const ALL: [LifecycleState; 6] = [
        Initial,
        Ready,
        Activated,
        Deactivating,
        Deactivated,
        BootError,
    ];

    #[test]
    fn test_forward_chain_is_legal() {
        assert!(Initial.can_advance_to(Ready));
        assert!(Ready.can_advance_to(Activated));
        assert!(Activated.can_advance_to(Deactivating));
        assert!(Deactivating.can_advance_to(Deactivated));
    }

    #[test]
    fn test_no_regression() {
        for from in ALL {
            for to in ALL {
                if to != BootError && from != BootError && to.as_raw() <= from.as_raw() {
                    assert!(!from.can_advance_to(to), "{} -> {}", from, to);
                }
            }
        }
    }

    #[test]
    fn test_boot_error_reachability() {
        assert!(Initial.can_advance_to(BootError));
        assert!(Ready.can_advance_to(BootError));
        assert!(!Activated.can_advance_to(BootError));
        assert!(!Deactivating.can_advance_to(BootError));
        for to in ALL {
            assert!(!BootError.can_advance_to(to));
            assert!(!Deactivated.can_advance_to(to));
        }
    }

    #[test]
    fn test_raw_roundtrip() {
        for state in ALL {
            assert_eq!(LifecycleState::from_raw(state.as_raw()), Some(state));
        }
        assert_eq!(LifecycleState::from_raw(0), None);
        assert_eq!(ShutdownRequest::from_raw(2), ShutdownRequest::Forceful);
        assert_eq!(ShutdownRequest::from_raw(9), ShutdownRequest::None);
    }
}

//! Lock Registry: one exclusive advisory lock per configuration.
//!
//! The lock file is the ground truth for "is a server associated with this
//! configuration". While held, its entire contents are the owner's PID in
//! decimal ASCII ([`PidRecord`]).
//!
//! [`AdvisoryLock::probe`] is inherently racy: it attempts and immediately
//! releases a non-blocking lock on a second descriptor, so a concurrent
//! acquisition can slip in between. `NotLocked` therefore means "look again",
//! and every caller polls.

mod lock_file;

pub use lock_file::LockFile;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Observed state of a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// No file at the path: the definitive "not running" signal.
    NoFile,
    /// File present but unlocked: stale or transient.
    NotLocked,
    /// File present and locked by some process.
    Locked,
    /// The probe itself failed (permissions, I/O).
    Error,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockState::NoFile => "no_file",
            LockState::NotLocked => "not_locked",
            LockState::Locked => "locked",
            LockState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Serialization contract for the lock file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord(pub u32);

impl PidRecord {
    pub fn encode(&self) -> String {
        self.0.to_string()
    }

    /// Parse lock file contents. Empty or partially written contents, and
    /// PID 0, yield `None`.
    pub fn parse(contents: &str) -> Option<Self> {
        match contents.trim().parse::<u32>() {
            Ok(0) | Err(_) => None,
            Ok(pid) => Some(PidRecord(pid)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.0
    }
}

/// Exclusive advisory lock with a readable owner.
pub trait AdvisoryLock {
    /// Take the lock and publish the caller's PID. Fails with
    /// [`crate::TgError::LockHeld`] when another holder exists.
    fn acquire(&mut self) -> Result<()>;

    /// Release the lock, unlinking the file if this handle holds it.
    fn release(&mut self) -> Result<()>;

    /// Non-blocking, side-effect-free observation. Never fails.
    fn probe(&self) -> LockState;

    /// PID published in the lock file, if any.
    fn owner(&self) -> Option<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_record_roundtrip() {
        let record = PidRecord(4242);
        assert_eq!(record.encode(), "4242");
        assert_eq!(PidRecord::parse(&record.encode()), Some(record));
    }

    #[test]
    fn test_pid_record_rejects_partial_contents() {
        assert_eq!(PidRecord::parse(""), None);
        assert_eq!(PidRecord::parse("   "), None);
        assert_eq!(PidRecord::parse("0"), None);
        assert_eq!(PidRecord::parse("12ab"), None);
        assert_eq!(PidRecord::parse("77\n"), Some(PidRecord(77)));
    }

    #[test]
    fn test_lock_state_display() {
        assert_eq!(LockState::NoFile.to_string(), "no_file");
        assert_eq!(LockState::NotLocked.to_string(), "not_locked");
    }
}

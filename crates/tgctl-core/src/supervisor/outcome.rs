//! Result of one supervisor operation.

use serde::Serialize;
use std::fmt;

/// Exit status of the `tgctl` binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const TIMED_OUT: i32 = 2;
    pub const CONFIG_ERROR: i32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    /// Nothing to stop; the desired end state already holds.
    NotRunning,
    AlreadyRunning,
    AlreadyRequested,
    /// Another process won the lock while this one was starting a server.
    LostRace,
    /// The launched server exited or reported `boot_error`.
    BootFailed,
    TimedOut,
    Failed,
}

impl OutcomeKind {
    pub fn exit_code(self) -> i32 {
        match self {
            OutcomeKind::Success | OutcomeKind::NotRunning => exit_code::SUCCESS,
            OutcomeKind::TimedOut => exit_code::TIMED_OUT,
            OutcomeKind::AlreadyRunning
            | OutcomeKind::AlreadyRequested
            | OutcomeKind::LostRace
            | OutcomeKind::BootFailed
            | OutcomeKind::Failed => exit_code::FAILURE,
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::NotRunning => "not_running",
            OutcomeKind::AlreadyRunning => "already_running",
            OutcomeKind::AlreadyRequested => "already_requested",
            OutcomeKind::LostRace => "lost_race",
            OutcomeKind::BootFailed => "boot_failed",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One success/failure answer plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub reason: String,
    /// Server process the operation concerned, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Outcome {
    pub fn new(kind: OutcomeKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            pid: None,
        }
    }

    pub fn success(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Success, reason)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Failed, reason)
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == exit_code::SUCCESS
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::success("started").exit_code(), 0);
        assert_eq!(Outcome::new(OutcomeKind::NotRunning, "").exit_code(), 0);
        assert_eq!(Outcome::new(OutcomeKind::TimedOut, "").exit_code(), 2);
        assert_eq!(Outcome::new(OutcomeKind::AlreadyRequested, "").exit_code(), 1);
        assert_eq!(Outcome::new(OutcomeKind::LostRace, "").exit_code(), 1);
        assert!(!Outcome::failed("boom").is_success());
    }

    #[test]
    fn test_serializes_kind_in_snake_case() {
        let outcome = Outcome::new(OutcomeKind::BootFailed, "exit status 1").with_pid(Some(7));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "boot_failed");
        assert_eq!(json["pid"], 7);
        assert_eq!(outcome.to_string(), "boot_failed: exit status 1");
    }
}

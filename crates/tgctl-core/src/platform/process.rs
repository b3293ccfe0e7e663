//! Platform-specific process management.
//!
//! Liveness checks and unconditional termination used by the supervisor and
//! by the transport's peer-liveness probes.

use crate::error::{Result, TgError};
use tracing::{debug, warn};

/// PID of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`; `EPERM` still means the process exists
/// - **Other**: assumed alive
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Send an unconditional kill signal to a process.
///
/// Returns `Ok(false)` when the process did not exist, `Ok(true)` when the
/// signal was delivered.
pub fn kill_process(pid: u32) -> Result<bool> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(TgError::Validation {
            field: "pid".to_string(),
            message: format!("{} is not a killable process id", pid),
        });
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // No reaping here: the flock held by the victim is released at exit,
        // which is all the supervisor waits for.
        debug!("Sending SIGKILL to process {}", pid);
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!("Process {} does not exist", pid);
                Ok(false)
            }
            Err(e) => {
                warn!("Failed to send SIGKILL to {}: {}", pid, e);
                Err(TgError::Other(format!("Failed to kill process {}: {}", pid, e)))
            }
        }
    }

    #[cfg(not(unix))]
    {
        Err(TgError::Other(
            "Process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(current_pid()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(4_000_000_000));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_kill_rejects_pid_zero() {
        assert!(kill_process(0).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_child_process() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        assert!(kill_process(pid).unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}

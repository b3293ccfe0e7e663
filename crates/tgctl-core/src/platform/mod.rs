//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than being
//! scattered through the lock, status and transport code.
//!
//! - `paths` - default locations for configuration and shared-memory segments
//! - `process` - liveness checks and signal delivery

pub mod paths;
pub mod process;

pub use paths::{default_config_path, default_shm_dir};
pub use process::{current_pid, is_process_alive, kill_process};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform() {
        let platform = current_platform();
        assert!(["linux", "macos", "unknown"].contains(&platform));
    }
}

//! Platform-specific default paths.

use std::path::{Path, PathBuf};

/// Environment variable overriding the default configuration file.
pub const CONFIG_ENV_VAR: &str = "TGCTL_CONF";

/// Directory holding shared-memory segments.
///
/// # Platform Behavior
/// - **Linux**: `/dev/shm` (RAM-backed tmpfs) when present
/// - **Other**: the system temp directory
pub fn default_shm_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let dev_shm = Path::new("/dev/shm");
        if dev_shm.is_dir() {
            return dev_shm.to_path_buf();
        }
    }

    std::env::temp_dir()
}

/// Configuration file used when `--conf` is not given.
///
/// Resolution order: `TGCTL_CONF`, then `<config dir>/tgctl/tgctl.json`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir().map(|dir| dir.join("tgctl").join("tgctl.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shm_dir_exists() {
        assert!(default_shm_dir().is_dir());
    }
}

//! Detached launch of the server binary.

#![allow(unsafe_code)]

use crate::config::SupervisorConfig;
use crate::error::{Result, TgError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{debug, error, info};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Environment variable naming the server binary.
pub const SERVER_BINARY_ENV: &str = "TGSERVER";

/// Configuration for launching the server.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Server executable.
    pub binary: PathBuf,
    /// Configuration file passed to the server.
    pub config_path: PathBuf,
    /// Additional arguments to pass.
    pub extra_args: Vec<String>,
    /// Environment variables to set.
    pub env_vars: HashMap<String, String>,
    /// Path to write stdout/stderr logs.
    pub log_file: Option<PathBuf>,
}

impl LaunchConfig {
    pub fn new(binary: impl AsRef<Path>, config_path: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            config_path: config_path.as_ref().to_path_buf(),
            extra_args: Vec::new(),
            env_vars: HashMap::new(),
            log_file: None,
        }
    }

    /// Add an extra argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Set the log file path.
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }
}

/// A spawned server process.
#[derive(Debug)]
pub struct LaunchedServer {
    child: Child,
    log_path: Option<PathBuf>,
}

impl LaunchedServer {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Exit status if the process has already exited.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }
}

/// Launcher for the server binary.
pub struct ServerLauncher;

impl ServerLauncher {
    /// Resolve the server executable: an explicit path, then the
    /// `TGSERVER` environment variable, then a `tgserver` next to the
    /// running executable.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(SERVER_BINARY_ENV)
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::current_exe().ok().and_then(|exe| {
                        exe.parent()
                            .map(|dir| dir.join(SupervisorConfig::SERVER_BINARY_NAME))
                    })
                }),
        };

        match candidate {
            Some(path) if path.is_file() => Ok(path),
            Some(path) => Err(TgError::LaunchFailed {
                message: format!("server binary not found: {}", path.display()),
            }),
            None => Err(TgError::LaunchFailed {
                message: "cannot determine server binary location".to_string(),
            }),
        }
    }

    /// Spawn the server detached from the caller.
    pub fn launch(config: &LaunchConfig) -> Result<LaunchedServer> {
        if !config.binary.is_file() {
            return Err(TgError::LaunchFailed {
                message: format!("server binary not found: {}", config.binary.display()),
            });
        }

        let mut cmd = Command::new(&config.binary);
        cmd.arg("--conf").arg(&config.config_path);
        cmd.args(&config.extra_args);
        for (key, value) in &config.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());

        let log_path = config.log_file.clone();
        if let Some(ref log_file) = log_path {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent).map_err(|e| TgError::io_with_path(e, parent))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .map_err(|e| TgError::io_with_path(e, log_file))?;
            let stdout_file = file
                .try_clone()
                .map_err(|e| TgError::io_with_path(e, log_file))?;
            cmd.stdout(Stdio::from(stdout_file));
            cmd.stderr(Stdio::from(file));
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        // Detach so the server outlives the supervisor and is not signalled
        // with the supervisor's process group.
        #[cfg(unix)]
        {
            // SAFETY: setsid() is async-signal-safe and only affects the child.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        debug!(
            "Launching {} --conf {}",
            config.binary.display(),
            config.config_path.display()
        );
        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", config.binary.display(), e);
            TgError::LaunchFailed {
                message: format!("failed to spawn {}: {}", config.binary.display(), e),
            }
        })?;

        info!("Launched server with PID {}", child.id());
        Ok(LaunchedServer { child, log_path })
    }
}

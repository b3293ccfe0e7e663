//! `fs2`-backed implementation of the Lock Registry.

use super::{AdvisoryLock, LockState, PidRecord};
use crate::error::{Result, TgError};
use crate::platform;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lock file at a configuration-derived path.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: Option<File>,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Unlink the lock file regardless of who holds it. Used by Kill once the
    /// owner is gone. Returns `true` if a file was removed.
    pub fn remove_stale(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed lock file {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TgError::io_with_path(e, &self.path)),
        }
    }

    fn publish_pid(&self, file: &mut File) -> Result<()> {
        let record = PidRecord(platform::current_pid());
        file.set_len(0)
            .map_err(|e| TgError::io_with_path(e, &self.path))?;
        file.write_all(record.encode().as_bytes())
            .map_err(|e| TgError::io_with_path(e, &self.path))?;
        file.sync_data()
            .map_err(|e| TgError::io_with_path(e, &self.path))?;
        Ok(())
    }

    /// The locked descriptor must still name the file at `path`; otherwise
    /// the file was unlinked or replaced between open and lock.
    #[cfg(unix)]
    fn same_file(&self, file: &File) -> Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let held = file
            .metadata()
            .map_err(|e| TgError::io_with_path(e, &self.path))?;
        match std::fs::metadata(&self.path) {
            Ok(current) => Ok(held.ino() == current.ino() && held.dev() == current.dev()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TgError::io_with_path(e, &self.path)),
        }
    }

    #[cfg(not(unix))]
    fn same_file(&self, _file: &File) -> Result<bool> {
        Ok(self.path.exists())
    }
}

impl AdvisoryLock for LockFile {
    fn acquire(&mut self) -> Result<()> {
        if self.held.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TgError::io_with_path(e, parent))?;
        }

        // Truncation waits until the lock is held so a losing contender never
        // clobbers the winner's PID.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| TgError::io_with_path(e, &self.path))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Lock {} is held by another process", self.path.display());
                return Err(TgError::LockHeld {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(TgError::io_with_path(e, &self.path)),
        }

        if !self.same_file(&file)? {
            let _ = FileExt::unlock(&file);
            warn!(
                "Lock file {} was replaced while locking",
                self.path.display()
            );
            return Err(TgError::LockHeld {
                path: self.path.clone(),
            });
        }

        if let Err(e) = self.publish_pid(&mut file) {
            let _ = FileExt::unlock(&file);
            return Err(e);
        }

        info!(
            "Acquired lock {} (pid {})",
            self.path.display(),
            platform::current_pid()
        );
        self.held = Some(file);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let Some(file) = self.held.take() else {
            return Ok(());
        };

        // Unlink while still holding the lock: observers go straight from
        // `locked` to `no_file`.
        let removed = match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TgError::io_with_path(e, &self.path)),
        };

        if let Err(e) = FileExt::unlock(&file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
        debug!("Released lock {}", self.path.display());
        removed
    }

    fn probe(&self) -> LockState {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return LockState::NoFile,
            Err(e) => {
                debug!("Lock probe on {} failed: {}", self.path.display(), e);
                return LockState::Error;
            }
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                LockState::NotLocked
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => LockState::Locked,
            Err(e) => {
                debug!("Lock probe on {} failed: {}", self.path.display(), e);
                LockState::Error
            }
        }
    }

    fn owner(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|contents| PidRecord::parse(&contents))
            .map(|record| record.pid())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.held.is_some() {
            if let Err(e) = self.release() {
                warn!("Failed to release lock on drop: {}", e);
            }
        }
    }
}

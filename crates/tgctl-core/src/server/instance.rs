//! Server side of the lock/status protocol.
//!
//! Boot order: take the lock, create the status block (`initial`), go
//! `ready`, start the endpoint, go `activated`. A failure after the status
//! block exists publishes `boot_error`, keeps it visible briefly for
//! pollers, then tears down. Shutdown order: `deactivating`, stop the
//! endpoint, `deactivated`, destroy the status block, unlink the lock file.

use crate::cancel::CancellationToken;
use crate::config::{InstanceConfig, ServerConfig, TransportConfig};
use crate::error::{Result, TgError};
use crate::lock::{AdvisoryLock, LockFile};
use crate::platform;
use crate::status::{LifecycleState, ShutdownRequest, StatusBlock};
use crate::transport::{Authenticator, Dispatch, EndpointHandle, EndpointServer};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A booted server owning the lock and status block of one configuration.
pub struct ServerInstance {
    config: InstanceConfig,
    lock: LockFile,
    status: StatusBlock,
    endpoint: Option<EndpointHandle>,
    finished: bool,
}

impl ServerInstance {
    /// Run the boot sequence. On error every resource taken has been
    /// released again.
    pub fn boot(
        config: &InstanceConfig,
        authenticator: Arc<dyn Authenticator>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self> {
        std::fs::create_dir_all(config.shm_dir())
            .map_err(|e| TgError::io_with_path(e, config.shm_dir()))?;

        let mut lock = LockFile::new(config.lock_file_path());
        acquire_lock(&mut lock)?;

        let status = match StatusBlock::create(config.status_segment_path()) {
            Ok(status) => status,
            Err(e) => {
                if let Err(release) = lock.release() {
                    warn!("Failed to release lock after boot failure: {}", release);
                }
                return Err(e);
            }
        };

        let mut instance = Self {
            config: config.clone(),
            lock,
            status,
            endpoint: None,
            finished: false,
        };
        match instance.activate(authenticator, dispatch) {
            Ok(()) => {
                info!(
                    "Server {} is activated for {}",
                    platform::current_pid(),
                    config.config_path().display()
                );
                Ok(instance)
            }
            Err(e) => {
                error!("Boot failed: {}", e);
                instance.fail_boot();
                Err(e)
            }
        }
    }

    fn activate(
        &mut self,
        authenticator: Arc<dyn Authenticator>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<()> {
        self.status.advance(LifecycleState::Ready)?;
        self.endpoint = Some(EndpointServer::start(&self.config, authenticator, dispatch)?);
        self.status.advance(LifecycleState::Activated)
    }

    fn fail_boot(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.shutdown(None);
        }
        match self.status.advance(LifecycleState::BootError) {
            Ok(()) => std::thread::sleep(ServerConfig::BOOT_ERROR_LINGER),
            Err(e) => warn!("Cannot publish boot_error: {}", e),
        }
        if let Err(e) = self.release_resources() {
            warn!("Cleanup after boot failure incomplete: {}", e);
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusBlock {
        &self.status
    }

    pub fn endpoint(&self) -> Option<&EndpointHandle> {
        self.endpoint.as_ref()
    }

    /// Block until a shutdown request is placed on the status block. A
    /// cancelled token places a graceful request first.
    pub fn wait_for_shutdown(&self, cancel: &CancellationToken) -> Result<ShutdownRequest> {
        loop {
            if cancel.is_cancelled() {
                if self.status.request_shutdown(ShutdownRequest::Graceful)? {
                    info!("Local interrupt placed a graceful shutdown request");
                }
                return Ok(self.status.shutdown_request());
            }
            if let Some(request) = self
                .status
                .wait_for_shutdown_request(TransportConfig::WAIT_QUANTUM)?
            {
                info!("Received {} shutdown request", request);
                return Ok(request);
            }
        }
    }

    /// Wait for a shutdown request and carry it out.
    pub fn run(self, cancel: &CancellationToken) -> Result<ShutdownRequest> {
        let request = self.wait_for_shutdown(cancel)?;
        self.shutdown(request)?;
        Ok(request)
    }

    /// Deactivate and release everything. A graceful request lets sessions
    /// finish their in-flight requests first.
    pub fn shutdown(mut self, request: ShutdownRequest) -> Result<()> {
        self.finished = true;
        let mut first_error = self.status.advance(LifecycleState::Deactivating).err();

        if let Some(mut endpoint) = self.endpoint.take() {
            let grace = match request {
                ShutdownRequest::Forceful => None,
                ShutdownRequest::Graceful | ShutdownRequest::None => {
                    Some(ServerConfig::SESSION_DRAIN_TIMEOUT)
                }
            };
            endpoint.shutdown(grace);
        }

        if let Err(e) = self.status.advance(LifecycleState::Deactivated) {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.release_resources() {
            first_error.get_or_insert(e);
        }
        info!("Server {} stopped ({})", platform::current_pid(), request);
        first_error.map_or(Ok(()), Err)
    }

    /// Destroy the status block, then unlink and unlock the lock file.
    fn release_resources(&mut self) -> Result<()> {
        self.finished = true;
        let destroyed = StatusBlock::destroy(self.status.path());
        let released = self.lock.release();
        destroyed?;
        released
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!("Server instance dropped without shutdown; tearing down");
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.shutdown(None);
        }
        let _ = self.status.advance(LifecycleState::Deactivating);
        let _ = self.status.advance(LifecycleState::Deactivated);
        if let Err(e) = self.release_resources() {
            warn!("Teardown incomplete: {}", e);
        }
    }
}

/// Take the lock, riding out probers that hold it for an instant. A live
/// owner other than a prober fails immediately.
fn acquire_lock(lock: &mut LockFile) -> Result<()> {
    let mut attempt = 0;
    loop {
        match lock.acquire() {
            Ok(()) => return Ok(()),
            Err(TgError::LockHeld { path }) => {
                let owner = lock.owner().filter(|pid| platform::is_process_alive(*pid));
                attempt += 1;
                if owner.is_some() || attempt >= ServerConfig::LOCK_RETRY_ATTEMPTS {
                    return Err(TgError::LockHeld { path });
                }
                debug!("Lock {} briefly held; retrying", path.display());
                std::thread::sleep(ServerConfig::LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::lock::LockState;
    use crate::transport::{AcceptAll, Request, RequestContext, Response};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Echo;

    impl Dispatch for Echo {
        fn dispatch(&self, _ctx: &RequestContext<'_>, _request: Request) -> Result<Response> {
            Ok(Response::Restored)
        }
    }

    fn config(dir: &TempDir) -> InstanceConfig {
        let path = dir.path().join("tg.json");
        std::fs::write(&path, "").unwrap();
        let document = ConfigDocument {
            database_name: "inst".into(),
            shm_dir: Some(dir.path().join("shm")),
            ..Default::default()
        };
        InstanceConfig::from_document(&path, document).unwrap()
    }

    fn boot(config: &InstanceConfig) -> Result<ServerInstance> {
        ServerInstance::boot(config, Arc::new(AcceptAll), Arc::new(Echo))
    }

    #[test]
    fn test_boot_publishes_activated() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let instance = boot(&config).unwrap();

        assert_eq!(instance.status().state(), Some(LifecycleState::Activated));
        assert_eq!(instance.status().owner_pid(), platform::current_pid());
        let lock = LockFile::new(config.lock_file_path());
        assert_eq!(lock.probe(), LockState::Locked);
        assert_eq!(lock.owner(), Some(platform::current_pid()));
        assert!(config.admission_segment_path().exists());

        instance.shutdown(ShutdownRequest::Graceful).unwrap();
        assert_eq!(lock.probe(), LockState::NoFile);
        assert!(!config.status_segment_path().exists());
        assert!(!config.admission_segment_path().exists());
    }

    #[test]
    fn test_second_boot_is_refused() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let first = boot(&config).unwrap();

        assert!(matches!(boot(&config), Err(TgError::LockHeld { .. })));
        assert_eq!(first.status().state(), Some(LifecycleState::Activated));
        first.shutdown(ShutdownRequest::Forceful).unwrap();
    }

    #[test]
    fn test_failed_boot_releases_everything() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        // A directory where the admission segment belongs makes the
        // endpoint fail after the status block exists.
        std::fs::create_dir_all(config.admission_segment_path()).unwrap();

        assert!(boot(&config).is_err());
        assert!(!config.lock_file_path().exists());
        assert!(!config.status_segment_path().exists());
    }

    #[test]
    fn test_shutdown_request_is_observed() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let instance = boot(&config).unwrap();

        let requester = {
            let path = config.status_segment_path();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                let status = StatusBlock::attach(path).unwrap();
                assert!(status.request_shutdown(ShutdownRequest::Forceful).unwrap());
            })
        };
        let request = instance.run(&CancellationToken::new()).unwrap();
        requester.join().unwrap();
        assert_eq!(request, ShutdownRequest::Forceful);
        assert!(!config.lock_file_path().exists());
    }

    #[test]
    fn test_cancel_places_graceful_request() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let instance = boot(&config).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            instance.wait_for_shutdown(&cancel).unwrap(),
            ShutdownRequest::Graceful
        );
        instance.shutdown(ShutdownRequest::Graceful).unwrap();
    }

    #[test]
    fn test_drop_tears_down() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        drop(boot(&config).unwrap());
        assert!(!config.lock_file_path().exists());
        assert!(!config.status_segment_path().exists());
    }
}

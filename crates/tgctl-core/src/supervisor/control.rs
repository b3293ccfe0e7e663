//! Start, shutdown, kill and status over the lock and status probes.
//!
//! Every protocol is a polling loop: probe, decide, sleep one quantum. The
//! lock probe is racy (`NotLocked` may be a concurrent prober), so no single
//! observation is trusted except the ones the protocol names as confirmed.

use super::monitor::Monitor;
use super::outcome::{Outcome, OutcomeKind};
use super::probe::{ProbeReport, SegmentView, ServerStatus};
use crate::config::{InstanceConfig, ShmConfig, SupervisorConfig};
use crate::lock::{AdvisoryLock, LockFile, LockState};
use crate::platform;
use crate::process::{LaunchConfig, LaunchedServer, ServerLauncher};
use crate::status::{LifecycleState, ShutdownRequest, StatusBlock};
use crate::transport::{AdmissionQueue, ResultsetSet, SessionWire};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Polling parameters shared by all supervisor operations.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// `None` waits without bound.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: SupervisorConfig::POLL_INTERVAL,
        }
    }
}

impl SupervisorOptions {
    /// A zero timeout means unbounded.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    fn expired(&self) -> bool {
        self.0.is_some_and(|end| Instant::now() >= end)
    }
}

enum Poll {
    Done(Outcome),
    Pending,
}

/// Drives one configuration's server.
pub struct Supervisor<'a> {
    config: &'a InstanceConfig,
    options: SupervisorOptions,
}

impl<'a> Supervisor<'a> {
    pub fn new(config: &'a InstanceConfig, options: SupervisorOptions) -> Self {
        Self { config, options }
    }

    fn lock_file(&self) -> LockFile {
        LockFile::new(self.config.lock_file_path())
    }

    /// Composition of both probes.
    pub fn status(&self, monitor: &mut dyn Monitor) -> (ServerStatus, ProbeReport) {
        monitor.start("status");
        let report = ProbeReport::collect(self.config);
        let status = report.server_status();
        if let Ok(data) = serde_json::to_value(&report) {
            monitor.status(serde_json::json!({ "status": status, "probe": data }));
        }
        monitor.finish(&Outcome::success(status.to_string()).with_pid(report.lock_owner));
        debug!("Status of {}: {}", self.config.database_name(), status);
        (status, report)
    }

    /// Launch a server and wait until it reports `ready` or `activated`.
    pub fn start(&self, launch: &LaunchConfig, force: bool, monitor: &mut dyn Monitor) -> Outcome {
        monitor.start("start");
        let outcome = self.start_inner(launch, force, monitor);
        info!("Start: {}", outcome);
        monitor.finish(&outcome);
        outcome
    }

    fn start_inner(&self, launch: &LaunchConfig, force: bool, monitor: &mut dyn Monitor) -> Outcome {
        if force {
            let killed = self.kill_inner(monitor);
            if !killed.is_success() {
                return killed;
            }
        }

        let report = ProbeReport::collect(self.config);
        if !report.is_down() {
            return Outcome::new(
                OutcomeKind::AlreadyRunning,
                format!("server is {}", report.server_status()),
            )
            .with_pid(report.lock_owner);
        }

        let mut server = match ServerLauncher::launch(launch) {
            Ok(server) => server,
            Err(e) => return Outcome::failed(e.to_string()),
        };
        let pid = server.pid();
        let deadline = Deadline::after(self.options.timeout);
        let lock = self.lock_file();

        let outcome = self.poll(deadline, monitor, || self.await_lock(&lock, &mut server));
        if let Some(outcome) = outcome {
            return outcome.with_pid(Some(pid));
        }
        let outcome = self.poll(deadline, monitor, || self.await_ready(&lock, &mut server));
        match outcome {
            Some(outcome) => outcome.with_pid(Some(pid)),
            None => Outcome::new(
                OutcomeKind::TimedOut,
                format!("server {} did not become ready in time", pid),
            )
            .with_pid(Some(pid)),
        }
    }

    /// Run `step` once per quantum. `Some` carries a decided outcome, `None`
    /// only for phases that completed without deciding one.
    fn poll(
        &self,
        deadline: Deadline,
        monitor: &mut dyn Monitor,
        mut step: impl FnMut() -> Option<Poll>,
    ) -> Option<Outcome> {
        let mut round = 0u64;
        loop {
            match step() {
                Some(Poll::Done(outcome)) => return Some(outcome),
                None => return None,
                Some(Poll::Pending) => {}
            }
            if deadline.expired() {
                return Some(Outcome::new(
                    OutcomeKind::TimedOut,
                    "deadline elapsed while waiting for the server",
                ));
            }
            round += 1;
            monitor.progress(round);
            std::thread::sleep(self.options.poll_interval);
        }
    }

    /// Phase one: wait until the child holds the lock.
    fn await_lock(&self, lock: &LockFile, server: &mut LaunchedServer) -> Option<Poll> {
        let pid = server.pid();
        if let LockState::Locked = lock.probe() {
            match lock.owner() {
                Some(owner) if owner == pid => {
                    debug!("Server {} holds {}", pid, lock.path().display());
                    return None;
                }
                Some(owner) if platform::is_process_alive(owner) => {
                    return Some(Poll::Done(Outcome::new(
                        OutcomeKind::LostRace,
                        format!("lock is held by another server (pid {})", owner),
                    )));
                }
                _ => {}
            }
        }
        match server.try_exit_status() {
            Ok(Some(status)) => Some(Poll::Done(Outcome::new(
                OutcomeKind::BootFailed,
                format!("server exited with {} before taking the lock", status),
            ))),
            Ok(None) => Some(Poll::Pending),
            Err(e) => Some(Poll::Done(Outcome::failed(e.to_string()))),
        }
    }

    /// Phase two: wait for the status block to report a usable state.
    fn await_ready(&self, lock: &LockFile, server: &mut LaunchedServer) -> Option<Poll> {
        let pid = server.pid();
        if let SegmentView::Present {
            owner_pid, state, ..
        } = SegmentView::from(StatusBlock::probe(self.config.status_segment_path()))
        {
            if owner_pid == pid {
                match state {
                    Some(LifecycleState::Ready) | Some(LifecycleState::Activated) => {
                        return Some(Poll::Done(Outcome::success(format!(
                            "server {} is {}",
                            pid,
                            state.map(|s| s.to_string()).unwrap_or_default()
                        ))));
                    }
                    Some(LifecycleState::BootError) => {
                        return Some(Poll::Done(Outcome::new(
                            OutcomeKind::BootFailed,
                            format!("server {} reported boot_error", pid),
                        )));
                    }
                    Some(LifecycleState::Deactivating) | Some(LifecycleState::Deactivated) => {
                        return Some(Poll::Done(Outcome::new(
                            OutcomeKind::BootFailed,
                            format!("server {} shut down during boot", pid),
                        )));
                    }
                    Some(LifecycleState::Initial) | None => {}
                }
            }
        }

        match lock.probe() {
            LockState::NoFile | LockState::NotLocked => {
                return Some(Poll::Done(Outcome::new(
                    OutcomeKind::BootFailed,
                    format!("server {} released the lock during boot", pid),
                )));
            }
            LockState::Locked | LockState::Error => {}
        }
        match server.try_exit_status() {
            Ok(Some(status)) => Some(Poll::Done(Outcome::new(
                OutcomeKind::BootFailed,
                format!("server exited with {} during boot", status),
            ))),
            Ok(None) => Some(Poll::Pending),
            Err(e) => Some(Poll::Done(Outcome::failed(e.to_string()))),
        }
    }

    /// Place a shutdown request and wait for the lock file to disappear.
    pub fn shutdown(&self, kind: ShutdownRequest, monitor: &mut dyn Monitor) -> Outcome {
        monitor.start("shutdown");
        let outcome = self.shutdown_inner(kind, monitor);
        info!("Shutdown ({}): {}", kind, outcome);
        monitor.finish(&outcome);
        outcome
    }

    fn shutdown_inner(&self, kind: ShutdownRequest, monitor: &mut dyn Monitor) -> Outcome {
        if kind == ShutdownRequest::None {
            return Outcome::failed("shutdown kind must be graceful or forceful");
        }

        let report = ProbeReport::collect(self.config);
        if report.is_down() {
            return Outcome::new(OutcomeKind::NotRunning, "server is not running");
        }
        let pid = report.lock_owner;

        let status = match StatusBlock::attach(self.config.status_segment_path()) {
            Ok(status) => status,
            Err(e) => {
                return Outcome::failed(format!("cannot attach status block: {}", e)).with_pid(pid)
            }
        };
        match status.request_shutdown(kind) {
            Ok(true) => {}
            Ok(false) => {
                return Outcome::new(
                    OutcomeKind::AlreadyRequested,
                    format!("a {} shutdown was already requested", status.shutdown_request()),
                )
                .with_pid(pid)
            }
            Err(e) => return Outcome::failed(e.to_string()).with_pid(pid),
        }
        drop(status);

        let lock = self.lock_file();
        let deadline = Deadline::after(self.options.timeout);
        let outcome = self.poll(deadline, monitor, || match lock.probe() {
            LockState::NoFile => Some(Poll::Done(Outcome::success("server stopped"))),
            _ => Some(Poll::Pending),
        });
        outcome
            .unwrap_or_else(|| Outcome::success("server stopped"))
            .with_pid(pid)
    }

    /// Kill the lock owner and remove every resource it left behind.
    pub fn kill(&self, monitor: &mut dyn Monitor) -> Outcome {
        monitor.start("kill");
        let outcome = self.kill_inner(monitor);
        info!("Kill: {}", outcome);
        monitor.finish(&outcome);
        outcome
    }

    fn kill_inner(&self, monitor: &mut dyn Monitor) -> Outcome {
        let lock = self.lock_file();
        if lock.probe() == LockState::NoFile {
            self.remove_segments();
            return Outcome::new(OutcomeKind::NotRunning, "no lock file");
        }

        let pid = lock.owner();
        if let Some(pid) = pid {
            match platform::kill_process(pid) {
                Ok(true) => info!("Sent kill to server {}", pid),
                Ok(false) => debug!("Server {} was already gone", pid),
                Err(e) => warn!("Failed to kill server {}: {}", pid, e),
            }
        }

        let bounded = match self.options.timeout {
            Some(timeout) => timeout.min(SupervisorConfig::KILL_TIMEOUT),
            None => SupervisorConfig::KILL_TIMEOUT,
        };
        let deadline = Deadline::after(Some(bounded));
        let waited = self.poll(deadline, monitor, || match lock.probe() {
            LockState::Locked => Some(Poll::Pending),
            _ => None,
        });
        if let Some(outcome) = waited {
            return Outcome::new(
                OutcomeKind::TimedOut,
                format!("lock is still held: {}", outcome.reason),
            )
            .with_pid(pid);
        }

        if let Err(e) = lock.remove_stale() {
            return Outcome::failed(e.to_string()).with_pid(pid);
        }
        self.remove_segments();
        Outcome::success(match pid {
            Some(pid) => format!("killed server {}", pid),
            None => "removed stale lock file".to_string(),
        })
        .with_pid(pid)
    }

    /// Remove the status block, admission queue and any session segments.
    fn remove_segments(&self) {
        if let Err(e) = StatusBlock::destroy(self.config.status_segment_path()) {
            warn!("Failed to remove status block: {}", e);
        }
        if let Err(e) = AdmissionQueue::remove(self.config.admission_segment_path()) {
            warn!("Failed to remove admission queue: {}", e);
        }

        let Ok(entries) = std::fs::read_dir(self.config.shm_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(session_id) = session_segment_id(self.config.database_name(), &name) else {
                continue;
            };
            let removed = if name.ends_with(ShmConfig::RESULTSET_SEGMENT_SUFFIX) {
                ResultsetSet::remove(entry.path())
            } else {
                SessionWire::remove(entry.path())
            };
            match removed {
                Ok(_) => debug!("Removed leftover segment of session {}", session_id),
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
    }
}

/// Session id encoded in a session or resultset segment name.
fn session_segment_id(database_name: &str, file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(database_name)?.strip_prefix('-')?;
    let digits = rest
        .strip_suffix(ShmConfig::RESULTSET_SEGMENT_SUFFIX)
        .unwrap_or(rest);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::supervisor::monitor::{JsonLinesMonitor, NullMonitor};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> InstanceConfig {
        let shm = dir.path().join("shm");
        std::fs::create_dir_all(&shm).unwrap();
        let path = dir.path().join("tg.json");
        std::fs::write(&path, "").unwrap();
        let document = ConfigDocument {
            database_name: "unit".into(),
            shm_dir: Some(shm),
            ..Default::default()
        };
        InstanceConfig::from_document(&path, document).unwrap()
    }

    fn fast() -> SupervisorOptions {
        SupervisorOptions::default()
            .with_timeout(Some(Duration::from_secs(2)))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_session_segment_names() {
        assert_eq!(session_segment_id("db", "db-12"), Some(12));
        assert_eq!(session_segment_id("db", "db-12-rs"), Some(12));
        assert_eq!(session_segment_id("db", "db"), None);
        assert_eq!(session_segment_id("db", "db-"), None);
        assert_eq!(session_segment_id("db", "db-x1"), None);
        assert_eq!(session_segment_id("db", "dbx-1"), None);
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let options = SupervisorOptions::default().with_timeout(Some(Duration::ZERO));
        assert!(options.timeout.is_none());
        assert!(!Deadline::after(options.timeout).expired());
        assert!(Deadline::after(Some(Duration::ZERO)).expired());
    }

    #[test]
    fn test_status_of_absent_server() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let supervisor = Supervisor::new(&config, fast());
        let mut monitor = JsonLinesMonitor::new(Vec::new());
        let (status, report) = supervisor.status(&mut monitor);
        assert_eq!(status, ServerStatus::Inactive);
        assert_eq!(report.lock, LockState::NoFile);

        let text = String::from_utf8(monitor.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("\"inactive\""));
    }

    #[test]
    fn test_shutdown_of_absent_server_is_not_running() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let outcome =
            Supervisor::new(&config, fast()).shutdown(ShutdownRequest::Graceful, &mut NullMonitor);
        assert_eq!(outcome.kind, OutcomeKind::NotRunning);
    }

    #[test]
    fn test_shutdown_request_is_placed_once() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut lock = LockFile::new(config.lock_file_path());
        lock.acquire().unwrap();
        let status = StatusBlock::create(config.status_segment_path()).unwrap();
        status.advance(LifecycleState::Ready).unwrap();
        status.advance(LifecycleState::Activated).unwrap();

        let options = fast().with_timeout(Some(Duration::from_millis(100)));
        let supervisor = Supervisor::new(&config, options);
        let first = supervisor.shutdown(ShutdownRequest::Graceful, &mut NullMonitor);
        assert_eq!(first.kind, OutcomeKind::TimedOut);
        assert_eq!(status.shutdown_request(), ShutdownRequest::Graceful);

        let second = supervisor.shutdown(ShutdownRequest::Forceful, &mut NullMonitor);
        assert_eq!(second.kind, OutcomeKind::AlreadyRequested);
        assert_eq!(status.shutdown_request(), ShutdownRequest::Graceful);
        lock.release().unwrap();
    }

    #[test]
    fn test_kill_cleans_stale_resources() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        // A stale lock file naming a process that cannot exist.
        std::fs::write(config.lock_file_path(), i32::MAX.to_string()).unwrap();
        drop(StatusBlock::create(config.status_segment_path()).unwrap());
        std::fs::write(config.session_segment_path(4), b"x").unwrap();
        std::fs::write(config.resultset_segment_path(4), b"x").unwrap();

        let outcome = Supervisor::new(&config, fast()).kill(&mut NullMonitor);
        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert!(!config.lock_file_path().exists());
        assert!(!config.status_segment_path().exists());
        assert!(!config.session_segment_path(4).exists());
        assert!(!config.resultset_segment_path(4).exists());
    }

    #[test]
    fn test_kill_without_lock_file_still_removes_status_block() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        drop(StatusBlock::create(config.status_segment_path()).unwrap());

        let outcome = Supervisor::new(&config, fast()).kill(&mut NullMonitor);
        assert_eq!(outcome.kind, OutcomeKind::NotRunning);
        assert!(outcome.is_success());
        assert!(!config.status_segment_path().exists());
    }

    #[test]
    fn test_start_refuses_when_running() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut lock = LockFile::new(config.lock_file_path());
        lock.acquire().unwrap();
        let status = StatusBlock::create(config.status_segment_path()).unwrap();
        status.advance(LifecycleState::Ready).unwrap();

        let launch = LaunchConfig::new(dir.path().join("missing"), config.config_path());
        let outcome = Supervisor::new(&config, fast()).start(&launch, false, &mut NullMonitor);
        assert_eq!(outcome.kind, OutcomeKind::AlreadyRunning);
        assert_eq!(outcome.pid, Some(platform::current_pid()));
        lock.release().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_start_reports_early_exit_as_boot_failure() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let Some(binary) = ["/bin/false", "/usr/bin/false"]
            .iter()
            .map(std::path::Path::new)
            .find(|p| p.is_file())
        else {
            return;
        };
        let launch = LaunchConfig::new(binary, config.config_path());
        let outcome = Supervisor::new(&config, fast()).start(&launch, false, &mut NullMonitor);
        assert_eq!(outcome.kind, OutcomeKind::BootFailed);
    }
}

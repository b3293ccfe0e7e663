//! Client-side session keep-alive.
//!
//! The transport cannot see a dead peer on its own, so every client session
//! runs a background thread that extends the server-side expiration deadline
//! at half the published window. The server reclaims sessions whose deadline
//! passes without renewal.

use crate::cancel::CancellationToken;
use crate::config::TransportConfig;
use crate::error::{Result, TgError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shortest interval ever used, whatever the window.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Renewal interval for an expiration window.
pub fn interval_for(window: Duration) -> Duration {
    (window / 2).max(MIN_INTERVAL)
}

/// Background renewal thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct KeepAlive {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Call `tick` every `interval` until stopped. A tick failing with
    /// `SessionClosed` or `PeerDied` ends the thread; other failures are
    /// logged and retried on the next interval.
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("tgctl-keepalive".into())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                loop {
                    while Instant::now() < next {
                        if token.is_cancelled() {
                            return;
                        }
                        let left = next.saturating_duration_since(Instant::now());
                        std::thread::sleep(left.min(TransportConfig::WAIT_QUANTUM));
                    }
                    if token.is_cancelled() {
                        return;
                    }

                    match tick() {
                        Ok(()) => debug!("Session expiration extended"),
                        Err(e @ (TgError::SessionClosed { .. } | TgError::PeerDied { .. })) => {
                            debug!("Keep-alive stopping: {}", e);
                            return;
                        }
                        Err(e) => warn!("Keep-alive tick failed: {}", e),
                    }
                    next = Instant::now() + interval;
                }
            })?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Keep-alive thread panicked");
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_interval_is_half_the_window() {
        assert_eq!(interval_for(Duration::from_secs(300)), Duration::from_secs(150));
        assert_eq!(interval_for(Duration::ZERO), MIN_INTERVAL);
    }

    #[test]
    fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut keep_alive = KeepAlive::spawn(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        keep_alive.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} ticks", seen);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(!keep_alive.is_running());
    }

    #[test]
    fn test_closed_session_ends_thread() {
        let keep_alive = KeepAlive::spawn(Duration::from_millis(10), || {
            Err(TgError::SessionClosed { session_id: 1 })
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while keep_alive.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!keep_alive.is_running());
    }
}

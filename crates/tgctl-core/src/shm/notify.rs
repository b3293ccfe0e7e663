//! Cross-process wake-ups over a shared sequence word.
//!
//! Every shared structure that someone may block on carries a `notify` word.
//! Writers change state, then bump the word and wake sleepers; waiters read
//! the word, re-check their condition, and sleep only while the word still
//! holds the value they read. On Linux the sleep is a shared (non-private)
//! futex wait so it works across processes mapping the same file; elsewhere
//! it degrades to a short sleep.
//!
//! No wait is ever unbounded: [`wait_until`] sleeps in quanta and re-checks
//! the peer's [`Liveness`] between them, so a reader whose peer died does not
//! hang.

#![allow(unsafe_code)]

use crate::error::{Result, TgError};
use crate::platform;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Probe for "is the other side still there".
pub trait Liveness: Send + Sync {
    /// Return an error (normally [`TgError::PeerDied`]) once the peer is gone.
    fn ensure_alive(&self) -> Result<()>;
}

/// Liveness probe that never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl Liveness for AlwaysAlive {
    fn ensure_alive(&self) -> Result<()> {
        Ok(())
    }
}

/// Liveness probe watching a process id.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLiveness {
    pub pid: u32,
}

impl Liveness for ProcessLiveness {
    fn ensure_alive(&self) -> Result<()> {
        if platform::is_process_alive(self.pid) {
            Ok(())
        } else {
            Err(TgError::PeerDied {
                message: format!("process {} exited", self.pid),
            })
        }
    }
}

/// How long and how patiently to block.
#[derive(Clone, Copy)]
pub struct WaitPolicy<'a> {
    /// Maximum single sleep before the liveness probe runs again.
    pub quantum: Duration,
    /// Give up (returning `None`) at this instant.
    pub deadline: Option<Instant>,
    pub liveness: &'a dyn Liveness,
}

impl<'a> WaitPolicy<'a> {
    pub fn new(quantum: Duration, liveness: &'a dyn Liveness) -> Self {
        Self {
            quantum,
            deadline: None,
            liveness,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        self.with_deadline(timeout.map(|t| Instant::now() + t))
    }
}

/// Current value of a notify word.
pub fn epoch(word: &AtomicU32) -> u32 {
    word.load(Ordering::Acquire)
}

/// Bump the word and wake every waiter on it.
pub fn notify_all(word: &AtomicU32) {
    word.fetch_add(1, Ordering::AcqRel);

    #[cfg(target_os = "linux")]
    {
        // SAFETY: `word` is a live, aligned u32 for the duration of the call;
        // FUTEX_WAKE does not access memory beyond the futex word.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

/// Sleep while `word` still equals `observed`, at most `timeout`.
/// Spurious returns are allowed; callers always re-check their condition.
pub fn wait_for_change(word: &AtomicU32, observed: u32, timeout: Duration) {
    if timeout.is_zero() {
        return;
    }

    #[cfg(target_os = "linux")]
    {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // SAFETY: `word` is a live, aligned u32 and `ts` outlives the call.
        // FUTEX_WAIT only reads the word; EAGAIN/ETIMEDOUT/EINTR are all
        // treated as "re-check".
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                observed,
                &ts as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        if word.load(Ordering::Acquire) == observed {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
    }
}

/// Block until `probe` yields a value, the deadline passes (`Ok(None)`), or
/// the liveness probe or `probe` itself fails.
pub fn wait_until<T>(
    word: &AtomicU32,
    policy: &WaitPolicy<'_>,
    mut probe: impl FnMut() -> Result<Option<T>>,
) -> Result<Option<T>> {
    loop {
        let observed = epoch(word);
        if let Some(value) = probe()? {
            return Ok(Some(value));
        }

        policy.liveness.ensure_alive()?;

        let mut sleep = policy.quantum;
        if let Some(deadline) = policy.deadline {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep = sleep.min(deadline - now);
        }

        wait_for_change(word, observed, sleep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_wait_until_returns_when_condition_holds() {
        let word = AtomicU32::new(0);
        let policy = WaitPolicy::new(Duration::from_millis(10), &AlwaysAlive);
        let value = wait_until(&word, &policy, || Ok(Some(42))).unwrap();
        assert_eq!(value, Some(42));
    }

    #[test]
    fn test_wait_until_times_out() {
        let word = AtomicU32::new(0);
        let policy = WaitPolicy::new(Duration::from_millis(5), &AlwaysAlive)
            .with_timeout(Some(Duration::from_millis(30)));
        let start = Instant::now();
        let value: Option<()> = wait_until(&word, &policy, || Ok(None)).unwrap();
        assert!(value.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let word = word.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                let policy = WaitPolicy::new(Duration::from_secs(5), &AlwaysAlive)
                    .with_timeout(Some(Duration::from_secs(10)));
                wait_until(&word, &policy, || {
                    Ok(flag.load(Ordering::Acquire).then_some(()))
                })
                .unwrap()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        notify_all(&word);

        assert_eq!(waiter.join().unwrap(), Some(()));
    }

    #[test]
    fn test_dead_peer_interrupts_wait() {
        struct Dead;
        impl Liveness for Dead {
            fn ensure_alive(&self) -> Result<()> {
                Err(TgError::PeerDied {
                    message: "gone".into(),
                })
            }
        }

        let word = AtomicU32::new(0);
        let policy = WaitPolicy::new(Duration::from_millis(5), &Dead);
        let result: Result<Option<()>> = wait_until(&word, &policy, || Ok(None));
        assert!(matches!(result, Err(TgError::PeerDied { .. })));
    }

    #[test]
    fn test_process_liveness() {
        assert!(ProcessLiveness {
            pid: platform::current_pid()
        }
        .ensure_alive()
        .is_ok());
        assert!(ProcessLiveness { pid: 4_000_000_000 }.ensure_alive().is_err());
    }
}

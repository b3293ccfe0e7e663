//! Per-session slot table bounding outstanding requests.
//!
//! A sender acquires a free slot index before writing a request and keeps it
//! until the matching response has been consumed. With K slots, the K+1-th
//! concurrent sender blocks until one frees up. The wait re-checks peer
//! liveness every quantum so it cannot outlive the server.

use crate::config::TransportConfig;
use crate::error::{Result, TgError};
use crate::shm::Liveness;
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::trace;

/// Client-side table of K correlation slots.
#[derive(Debug)]
pub struct SlotTable {
    busy: Mutex<Vec<bool>>,
    freed: Condvar,
}

impl SlotTable {
    pub fn new(capacity: u16) -> Self {
        Self {
            busy: Mutex::new(vec![false; usize::from(capacity.max(1))]),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<bool>>> {
        self.busy
            .lock()
            .map_err(|_| TgError::Other("slot table lock poisoned".into()))
    }

    pub fn capacity(&self) -> usize {
        self.lock().map(|busy| busy.len()).unwrap_or(0)
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .map(|busy| busy.iter().filter(|b| **b).count())
            .unwrap_or(0)
    }

    /// Take a free slot without blocking.
    pub fn try_acquire(&self) -> Result<Option<SlotGuard<'_>>> {
        let mut busy = self.lock()?;
        Ok(Self::claim(&mut busy).map(|index| SlotGuard { table: self, index }))
    }

    /// Take a free slot, blocking while all are held.
    pub fn acquire(&self, liveness: &dyn Liveness) -> Result<SlotGuard<'_>> {
        let mut busy = self.lock()?;
        loop {
            if let Some(index) = Self::claim(&mut busy) {
                trace!("Acquired slot {}", index);
                return Ok(SlotGuard { table: self, index });
            }

            drop(busy);
            liveness.ensure_alive()?;
            busy = self.lock()?;
            if busy.iter().all(|b| *b) {
                busy = self
                    .freed
                    .wait_timeout(busy, TransportConfig::WAIT_QUANTUM)
                    .map_err(|_| TgError::Other("slot table lock poisoned".into()))?
                    .0;
            }
        }
    }

    fn claim(busy: &mut [bool]) -> Option<u16> {
        let index = busy.iter().position(|b| !*b)?;
        busy[index] = true;
        Some(index as u16)
    }

    fn release(&self, index: u16) {
        if let Ok(mut busy) = self.busy.lock() {
            if let Some(slot) = busy.get_mut(usize::from(index)) {
                *slot = false;
            }
        }
        trace!("Released slot {}", index);
        self.freed.notify_one();
    }
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    table: &'a SlotTable,
    index: u16,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> u16 {
        self.index
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::AlwaysAlive;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_indices_are_distinct_and_reused() {
        let table = SlotTable::new(2);
        let a = table.try_acquire().unwrap().unwrap();
        let b = table.try_acquire().unwrap().unwrap();
        assert_ne!(a.index(), b.index());
        assert!(table.try_acquire().unwrap().is_none());
        assert_eq!(table.in_flight(), 2);

        let freed = a.index();
        drop(a);
        let c = table.try_acquire().unwrap().unwrap();
        assert_eq!(c.index(), freed);
    }

    #[test]
    fn test_k_plus_one_sender_blocks() {
        let table = Arc::new(SlotTable::new(4));
        let peak = Arc::new(AtomicUsize::new(0));
        let (acquired_tx, acquired_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let table = table.clone();
                let peak = peak.clone();
                let acquired_tx = acquired_tx.clone();
                let release_rx = release_rx.clone();
                std::thread::spawn(move || {
                    let guard = table.acquire(&AlwaysAlive).unwrap();
                    peak.fetch_max(table.in_flight(), Ordering::SeqCst);
                    acquired_tx.send(guard.index()).unwrap();
                    release_rx.lock().unwrap().recv().unwrap();
                })
            })
            .collect();

        for _ in 0..4 {
            acquired_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(acquired_rx
            .recv_timeout(Duration::from_millis(200))
            .is_err());
        assert_eq!(table.in_flight(), 4);

        release_tx.send(()).unwrap();
        acquired_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 4);
        assert_eq!(table.in_flight(), 0);
    }
}

//! Lamport clocks for ordering gossip events.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically advancing per-node counter. Local mutations `increment` it;
/// received events `witness` it so later local events order after everything
/// already seen.
#[derive(Debug, Default)]
pub(crate) struct LamportClock(AtomicU64);

impl LamportClock {
    pub(crate) fn time(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn witness(&self, seen: u64) {
        let mut current = self.0.load(Ordering::SeqCst);
        while current < seen {
            match self
                .0
                .compare_exchange(current, seen, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(now) => current = now,
            }
        }
    }
}

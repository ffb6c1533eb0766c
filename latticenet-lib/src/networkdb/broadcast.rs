//! Retransmit-limited broadcast queues.
//!
//! Queued frames are handed to the gossip tick a bounded number of times
//! before being dropped; the limit scales with the logarithm of the cluster
//! size so events reach every node with high probability without flooding.

use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_RETRANSMIT_MULT: usize = 4;

#[derive(Debug)]
struct QueuedBroadcast {
    frame: Vec<u8>,
    transmits: usize,
}

#[derive(Debug)]
pub(crate) struct BroadcastQueue {
    items: Mutex<Vec<QueuedBroadcast>>,
    retransmit_mult: usize,
}

impl Default for BroadcastQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RETRANSMIT_MULT)
    }
}

impl BroadcastQueue {
    pub(crate) fn new(retransmit_mult: usize) -> Self {
        Self { items: Mutex::new(Vec::new()), retransmit_mult }
    }

    pub(crate) fn queue(&self, frame: Vec<u8>) {
        self.lock().push(QueuedBroadcast { frame, transmits: 0 });
    }

    /// Collect frames up to `limit` bytes. Each returned frame's transmit
    /// count is bumped; frames that reached their retransmit limit are
    /// dropped from the queue.
    pub(crate) fn get_broadcasts(&self, limit: usize, cluster_size: usize) -> Vec<Vec<u8>> {
        let max_transmits = retransmit_limit(self.retransmit_mult, cluster_size);
        let mut used = 0usize;
        let mut out = Vec::new();
        self.lock().retain_mut(|item| {
            if used + item.frame.len() > limit {
                return true;
            }
            used += item.frame.len();
            out.push(item.frame.clone());
            item.transmits += 1;
            item.transmits < max_transmits
        });
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedBroadcast>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn retransmit_limit(mult: usize, cluster_size: usize) -> usize {
    let magnitude = ((cluster_size + 1) as f64).log10().ceil() as usize;
    (mult * magnitude).max(mult)
}

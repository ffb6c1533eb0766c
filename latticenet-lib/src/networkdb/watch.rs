//! Watch subscriptions over the table store.

use tokio::sync::mpsc;
use tracing::trace;

/// Queue depth granted to a subscriber beyond its snapshot. Slow consumers
/// lose events rather than blocking the writer.
pub(crate) const WATCH_QUEUE_LEN: usize = 512;

/// A table entry as seen by watch subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub table: String,
    pub network_id: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// Events describe the transition observed in the local store, not the wire
/// operation that caused it: a remote update for a never-seen key surfaces as
/// `Create`, and a delete carries the last locally known value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Create(EntryRecord),
    Update(EntryRecord),
    Delete(EntryRecord),
}

impl WatchEvent {
    pub fn record(&self) -> &EntryRecord {
        match self {
            WatchEvent::Create(r) | WatchEvent::Update(r) | WatchEvent::Delete(r) => r,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) table: Option<String>,
    pub(crate) network: Option<String>,
    pub(crate) tx: mpsc::Sender<WatchEvent>,
}

impl Subscriber {
    pub(crate) fn matches(&self, table: &str, network_id: &str) -> bool {
        if let Some(t) = &self.table {
            if t != table {
                return false;
            }
        }
        if let Some(n) = &self.network {
            if n != network_id {
                return false;
            }
        }
        true
    }

    /// Deliver without blocking. Returns false when the receiver is gone and
    /// the subscriber should be pruned.
    pub(crate) fn deliver(&self, event: WatchEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                trace!(
                    table = %ev.record().table,
                    key = %ev.record().key,
                    "watch queue full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EntryRecord {
        EntryRecord {
            table: "endpoints".to_string(),
            network_id: "net-1".to_string(),
            key: "k".to_string(),
            value: vec![1],
        }
    }

    #[test]
    fn filters_match() {
        let (tx, _rx) = mpsc::channel(1);
        let sub = Subscriber { id: 1, table: Some("endpoints".into()), network: None, tx };
        assert!(sub.matches("endpoints", "any"));
        assert!(!sub.matches("other", "any"));
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sub = Subscriber { id: 1, table: None, network: None, tx };
        assert!(sub.deliver(WatchEvent::Create(record())));
        // Queue is full now; the event is dropped but the subscriber stays.
        assert!(sub.deliver(WatchEvent::Update(record())));
        assert!(matches!(rx.try_recv(), Ok(WatchEvent::Create(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receiver_detaches() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sub = Subscriber { id: 1, table: None, network: None, tx };
        assert!(!sub.deliver(WatchEvent::Create(record())));
    }
}

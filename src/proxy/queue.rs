//! Per-device offline message buffer.
//!
//! Messages a client sends while the target device is offline are held in a
//! bounded FIFO and flushed in one pass when the device comes online. The
//! buffer is best-effort: entries expire after [`QUEUE_TTL`], and when the
//! queue is full the oldest entry is evicted.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Maximum entries buffered per device.
pub const MAX_QUEUED_MESSAGES: usize = 50;
/// Entries older than this are never delivered.
pub const QUEUE_TTL: Duration = Duration::from_secs(10);
/// Send attempts per entry during a flush.
pub const MAX_SEND_RETRIES: u32 = 3;

/// A client→device payload buffered while the device was offline.
#[derive(Debug)]
pub struct PendingMessage {
    pub message: Value,
    pub enqueued_at: Instant,
    pub retries: u32,
    /// Session that sent the message, notified once it is delivered.
    pub session_id: String,
}

impl PendingMessage {
    pub fn new(message: Value, session_id: String) -> Self {
        Self {
            message,
            enqueued_at: Instant::now(),
            retries: 0,
            session_id,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.enqueued_at.elapsed() >= QUEUE_TTL
    }
}

/// Bounded FIFO of pending messages for one device.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingMessage>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry, evicting the oldest when full. Returns the queue
    /// length after the push.
    pub fn push(&mut self, pending: PendingMessage) -> usize {
        if self.entries.len() >= MAX_QUEUED_MESSAGES {
            self.entries.pop_front();
        }
        self.entries.push_back(pending);
        self.entries.len()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.is_expired());
        before - self.entries.len()
    }

    /// Take every entry out of the queue (single-shot flush).
    pub fn drain(&mut self) -> Vec<PendingMessage> {
        self.entries.drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate_all(&mut self, by: Duration) {
        for entry in &mut self.entries {
            entry.enqueued_at = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(n: u64) -> PendingMessage {
        PendingMessage::new(json!({"type": "brew_start", "n": n}), "session-1".into())
    }

    #[test]
    fn push_reports_queue_depth() {
        let mut queue = PendingQueue::new();
        assert_eq!(queue.push(pending(1)), 1);
        assert_eq!(queue.push(pending(2)), 2);
        assert_eq!(queue.push(pending(3)), 3);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut queue = PendingQueue::new();
        for n in 0..MAX_QUEUED_MESSAGES as u64 + 5 {
            queue.push(pending(n));
        }
        assert_eq!(queue.len(), MAX_QUEUED_MESSAGES);
        let entries = queue.drain();
        // The first five were evicted from the head.
        assert_eq!(entries.first().unwrap().message["n"], 5);
        assert_eq!(
            entries.last().unwrap().message["n"],
            MAX_QUEUED_MESSAGES as u64 + 4
        );
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let mut queue = PendingQueue::new();
        let mut stale = pending(1);
        stale.enqueued_at = Instant::now() - Duration::from_secs(11);
        queue.push(stale);
        queue.push(pending(2));

        assert_eq!(queue.purge_expired(), 1);
        assert_eq!(queue.len(), 1);
        let entries = queue.drain();
        assert_eq!(entries[0].message["n"], 2);
    }

    #[test]
    fn expiry_is_exactly_the_ttl() {
        let mut fresh = pending(1);
        fresh.enqueued_at = Instant::now() - Duration::from_secs(9);
        assert!(!fresh.is_expired());

        let mut old = pending(2);
        old.enqueued_at = Instant::now() - Duration::from_secs(11);
        assert!(old.is_expired());
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut queue = PendingQueue::new();
        queue.push(pending(1));
        queue.push(pending(2));
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }
}

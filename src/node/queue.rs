//! src/node/queue.rs
//!
//! The outbound priority queue: a multi-producer, single-consumer channel
//! ordered by `(priority asc, enqueue-sequence asc)`. FLASH overtakes
//! anything not yet handed to the transports; within one precedence level
//! dispatch is FIFO by enqueue order.

use crate::domain::{Priority, TacticalMessage};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry {
    priority: Priority,
    sequence: u64,
    message: TacticalMessage,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, sequence)
// pair surfaces first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.sequence).cmp(&(self.priority, self.sequence))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

#[derive(Default)]
pub struct OutboundQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
    sequence: AtomicU64,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: TacticalMessage) {
        let entry = Entry {
            priority: message.priority,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            message,
        };
        self.heap.lock().expect("queue lock poisoned").push(entry);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<TacticalMessage> {
        self.heap
            .lock()
            .expect("queue lock poisoned")
            .pop()
            .map(|entry| entry.message)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().expect("queue lock poisoned").is_empty()
    }

    /// Waits up to `wait` for the highest-precedence queued message. The
    /// bounded wait keeps the transmit loop responsive to shutdown.
    pub async fn recv(&self, wait: Duration) -> Option<TacticalMessage> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.pop() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }
}

// --- Unit Tests ---

//! Bounded in-memory priority queue feeding the dispatcher workers.
//!
//! Ordered by `(effective priority, enqueue sequence)`: HIGH before MEDIUM
//! before LOW, FIFO within a tier. One global mutex — contention is low
//! (thousands of prompts per cycle, not millions). A `Notify` wakes
//! waiting workers on push.

use nudge_core::prompt::Priority;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Priority rank a prompt dispatches at, after the retry penalty. Each
/// failed attempt demotes one tier, so flapping prompts drift toward the
/// back instead of spinning at the front.
pub fn effective_rank(priority: Priority, retry_count: u32) -> u8 {
    (u32::from(priority.rank()) + retry_count).min(u32::from(Priority::Low.rank())) as u8
}

#[derive(Debug)]
struct QueueEntry {
    prompt_id: String,
    rank: u8,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; invert so the smallest (rank, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    /// Prompt ids currently enqueued; enqueueing is idempotent.
    ids: HashSet<String>,
    seq: u64,
}

/// The dispatch queue shared by the assembly path, the reclaim loop, and
/// the worker pool.
pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a prompt id at the given effective rank. Returns `false`
    /// when the queue is full or the id is already enqueued — in either
    /// case the prompt stays `QUEUED` in the store and a later reclaim
    /// pass retries the enqueue.
    pub fn push(&self, prompt_id: &str, rank: u8) -> bool {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.ids.contains(prompt_id) {
                return false;
            }
            if inner.ids.len() >= self.capacity {
                tracing::warn!("delivery queue full ({}), deferring {prompt_id}", self.capacity);
                return false;
            }
            inner.seq += 1;
            let seq = inner.seq;
            inner.ids.insert(prompt_id.to_string());
            inner.heap.push(QueueEntry {
                prompt_id: prompt_id.to_string(),
                rank,
                seq,
            });
        }
        self.notify.notify_one();
        true
    }

    /// Pop the highest-priority prompt id, waiting until one is available.
    pub async fn pop(&self) -> String {
        loop {
            if let Some(id) = self.try_pop() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    fn try_pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let entry = inner.heap.pop()?;
        inner.ids.remove(&entry.prompt_id);
        // There may be more work and more than one waiting worker.
        if !inner.heap.is_empty() {
            self.notify.notify_one();
        }
        Some(entry.prompt_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_then_fifo() {
        let q = DeliveryQueue::new(16);
        assert!(q.push("low-1", effective_rank(Priority::Low, 0)));
        assert!(q.push("high-1", effective_rank(Priority::High, 0)));
        assert!(q.push("med-1", effective_rank(Priority::Medium, 0)));
        assert!(q.push("high-2", effective_rank(Priority::High, 0)));

        assert_eq!(q.try_pop().as_deref(), Some("high-1"));
        assert_eq!(q.try_pop().as_deref(), Some("high-2"));
        assert_eq!(q.try_pop().as_deref(), Some("med-1"));
        assert_eq!(q.try_pop().as_deref(), Some("low-1"));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_push_is_idempotent_per_id() {
        let q = DeliveryQueue::new(16);
        assert!(q.push("p1", 0));
        assert!(!q.push("p1", 0));
        assert_eq!(q.len(), 1);
        q.try_pop();
        // Once popped, the id may be enqueued again (e.g. after a retry).
        assert!(q.push("p1", 1));
    }

    #[test]
    fn test_capacity_bound() {
        let q = DeliveryQueue::new(2);
        assert!(q.push("a", 0));
        assert!(q.push("b", 0));
        assert!(!q.push("c", 0));
        q.try_pop();
        assert!(q.push("c", 0));
    }

    #[test]
    fn test_retry_penalty_degrades_priority() {
        assert_eq!(effective_rank(Priority::High, 0), 0);
        assert_eq!(effective_rank(Priority::High, 1), 1);
        assert_eq!(effective_rank(Priority::High, 2), 2);
        // Saturates at the lowest tier.
        assert_eq!(effective_rank(Priority::High, 9), 2);
        assert_eq!(effective_rank(Priority::Low, 3), 2);

        let q = DeliveryQueue::new(16);
        q.push("retried-high", effective_rank(Priority::High, 2));
        q.push("fresh-med", effective_rank(Priority::Medium, 0));
        // The twice-failed HIGH prompt now queues behind a fresh MEDIUM.
        assert_eq!(q.try_pop().as_deref(), Some("fresh-med"));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let q = std::sync::Arc::new(DeliveryQueue::new(16));
        let q2 = std::sync::Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push("p1", 0);
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "p1");
    }
}

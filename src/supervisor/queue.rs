//! Bounded priority queue of task ids.
//!
//! Higher priority pops first; equal priorities pop in arrival order. Retried
//! tasks wait in a delayed set until their backoff elapses.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use uuid::Uuid;

use crate::error::SupervisorError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: i32,
    seq: u64,
    task_id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // Earlier arrivals are "greater" so the max-heap pops them first.
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct TaskQueue {
    ready: BinaryHeap<Entry>,
    delayed: Vec<(Instant, Entry)>,
    capacity: usize,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: BinaryHeap::new(),
            delayed: Vec::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Admit a new task; fails when the queue is at capacity.
    pub fn push(&mut self, task_id: Uuid, priority: i32) -> Result<(), SupervisorError> {
        if self.is_full() {
            return Err(SupervisorError::QueueFull {
                capacity: self.capacity,
            });
        }
        let entry = self.entry(task_id, priority);
        self.ready.push(entry);
        Ok(())
    }

    /// Put a task back, eligible from `ready_at`. Not subject to capacity:
    /// tasks already admitted are never dropped.
    pub fn requeue(&mut self, task_id: Uuid, priority: i32, ready_at: Instant) {
        let entry = self.entry(task_id, priority);
        if ready_at <= Instant::now() {
            self.ready.push(entry);
        } else {
            self.delayed.push((ready_at, entry));
        }
    }

    /// Move delayed tasks whose backoff has elapsed into the ready heap.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let before = self.delayed.len();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                self.ready.push(entry);
            } else {
                i += 1;
            }
        }
        before - self.delayed.len()
    }

    pub fn pop_ready(&mut self) -> Option<Uuid> {
        self.ready.pop().map(|e| e.task_id)
    }

    /// Remove a task wherever it waits. Returns whether it was queued.
    pub fn remove(&mut self, task_id: Uuid) -> bool {
        let before = self.len();
        self.ready.retain(|e| e.task_id != task_id);
        self.delayed.retain(|(_, e)| e.task_id != task_id);
        before != self.len()
    }

    /// Earliest time a delayed task becomes eligible.
    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.delayed.clear();
    }

    fn entry(&mut self, task_id: Uuid, priority: i32) -> Entry {
        let seq = self.next_seq;
        self.next_seq += 1;
        Entry {
            priority,
            seq,
            task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn priority_then_fifo() {
        let mut q = TaskQueue::new(10);
        let ids: Vec<_> = (0..4).map(|_| Uuid::new_v4()).collect();
        q.push(ids[0], 0).unwrap();
        q.push(ids[1], 5).unwrap();
        q.push(ids[2], 0).unwrap();
        q.push(ids[3], 5).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| q.pop_ready()).collect();
        assert_eq!(order, vec![ids[1], ids[3], ids[0], ids[2]]);
    }

    #[test]
    fn full_queue_rejects() {
        let mut q = TaskQueue::new(2);
        q.push(Uuid::new_v4(), 0).unwrap();
        q.push(Uuid::new_v4(), 0).unwrap();
        let err = q.push(Uuid::new_v4(), 0).unwrap_err();
        assert!(matches!(err, SupervisorError::QueueFull { capacity: 2 }));

        // Retries are never refused.
        q.requeue(Uuid::new_v4(), 0, Instant::now());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn delayed_requeue_waits_for_promotion() {
        let mut q = TaskQueue::new(10);
        let id = Uuid::new_v4();
        let now = Instant::now();
        q.requeue(id, 0, now + Duration::from_secs(60));
        assert_eq!(q.ready_len(), 0);
        assert!(q.pop_ready().is_none());
        assert_eq!(q.next_due(), Some(now + Duration::from_secs(60)));

        assert_eq!(q.promote_due(now), 0);
        assert_eq!(q.promote_due(now + Duration::from_secs(61)), 1);
        assert_eq!(q.pop_ready(), Some(id));
    }

    #[test]
    fn remove_from_either_set() {
        let mut q = TaskQueue::new(10);
        let ready = Uuid::new_v4();
        let delayed = Uuid::new_v4();
        q.push(ready, 0).unwrap();
        q.requeue(delayed, 0, Instant::now() + Duration::from_secs(60));

        assert!(q.remove(delayed));
        assert!(q.remove(ready));
        assert!(!q.remove(ready));
        assert!(q.is_empty());
    }
}

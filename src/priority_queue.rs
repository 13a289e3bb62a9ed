//! FIFO-within-priority job queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::job::{JobId, Priority};

struct Entry {
    priority: Priority,
    sequence: u64,
    job_id: JobId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, and within the
        // same priority the earlier-enqueued (lower sequence) job first —
        // achieved by reversing the sequence comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A max-heap of queued job ids ordered by `(priority desc, enqueue order
/// asc)`.
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Number of jobs currently queued.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Push a job id with its priority, assigning it a fresh FIFO sequence.
    /// Used for a job's first arrival on the queue (initial enqueue, or a
    /// genuine retry attempt after a failure) — anything that is a new
    /// scheduling attempt rather than a resource-race bounce. Returns the
    /// assigned sequence so the caller can carry it forward.
    pub fn push_new(&mut self, job_id: JobId, priority: Priority) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Entry {
            priority,
            sequence,
            job_id,
        });
        sequence
    }

    /// Push a job id back onto the queue at an already-assigned `sequence`,
    /// rather than minting a new one. Used when a job loses the
    /// token-bucket or agent-cap race in the worker loop: it must not lose
    /// its place in line to jobs that arrived after it, so it re-enters at
    /// the FIFO position it already held.
    pub fn push_at(&mut self, job_id: JobId, priority: Priority, sequence: u64) {
        self.heap.push(Entry {
            priority,
            sequence,
            job_id,
        });
    }

    /// Pop the highest-priority, earliest-enqueued job id.
    pub fn pop(&mut self) -> Option<JobId> {
        self.heap.pop().map(|e| e.job_id)
    }

    /// Remove a specific job id from the queue (used by cancellation),
    /// preserving heap ordering for the rest.
    pub fn remove(&mut self, job_id: &JobId) -> bool {
        let before = self.heap.len();
        let remaining: Vec<Entry> = self.heap.drain().filter(|e| &e.job_id != job_id).collect();
        self.heap = remaining.into_iter().collect();
        self.heap.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn higher_priority_dequeues_first() {
        let mut pq = PriorityQueue::new();
        pq.push_new(JobId::from_string("low"), Priority::Low);
        pq.push_new(JobId::from_string("high"), Priority::High);
        pq.push_new(JobId::from_string("normal"), Priority::Normal);
        assert_eq!(pq.pop(), Some(JobId::from_string("high")));
        assert_eq!(pq.pop(), Some(JobId::from_string("normal")));
        assert_eq!(pq.pop(), Some(JobId::from_string("low")));
    }

    #[test]
    fn same_priority_is_fifo() {
        let mut pq = PriorityQueue::new();
        pq.push_new(JobId::from_string("a"), Priority::Normal);
        pq.push_new(JobId::from_string("b"), Priority::Normal);
        pq.push_new(JobId::from_string("c"), Priority::Normal);
        assert_eq!(pq.pop(), Some(JobId::from_string("a")));
        assert_eq!(pq.pop(), Some(JobId::from_string("b")));
        assert_eq!(pq.pop(), Some(JobId::from_string("c")));
    }

    #[test]
    fn remove_takes_job_out_of_contention() {
        let mut pq = PriorityQueue::new();
        pq.push_new(JobId::from_string("a"), Priority::Normal);
        pq.push_new(JobId::from_string("b"), Priority::Normal);
        assert!(pq.remove(&JobId::from_string("a")));
        assert_eq!(pq.pop(), Some(JobId::from_string("b")));
        assert_eq!(pq.pop(), None);
    }

    #[test]
    fn push_at_preserves_original_fifo_position_across_a_resource_race_bounce() {
        let mut pq = PriorityQueue::new();
        let a_seq = pq.push_new(JobId::from_string("a"), Priority::Normal);
        pq.push_new(JobId::from_string("b"), Priority::Normal);
        // "a" is popped (peeked by a worker), loses a resource race, and is
        // bounced back at its original sequence rather than a fresh one —
        // it must still come out ahead of "b", and ahead of "c" enqueued
        // after the bounce.
        assert_eq!(pq.pop(), Some(JobId::from_string("a")));
        pq.push_at(JobId::from_string("a"), Priority::Normal, a_seq);
        pq.push_new(JobId::from_string("c"), Priority::Normal);
        assert_eq!(pq.pop(), Some(JobId::from_string("a")));
        assert_eq!(pq.pop(), Some(JobId::from_string("b")));
        assert_eq!(pq.pop(), Some(JobId::from_string("c")));
    }

    fn priority_from_tag(tag: u8) -> Priority {
        match tag % 4 {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }

    proptest! {
        // P-ordering: for any sequence of pushes, pop() always yields
        // strictly non-increasing priority, and within a run of equal
        // priority, strictly increasing original insertion order.
        #[test]
        fn pop_order_is_priority_desc_then_fifo_asc(tags in proptest::collection::vec(0u8..4, 0..64)) {
            let mut pq = PriorityQueue::new();
            for (i, tag) in tags.iter().enumerate() {
                pq.push_new(JobId::from_string(format!("j{i}")), priority_from_tag(*tag));
            }
            let mut popped = Vec::new();
            while let Some(id) = pq.pop() {
                let idx: usize = id.to_string()[1..].parse().unwrap();
                popped.push((tags[idx], idx));
            }
            for window in popped.windows(2) {
                let (prio_a, idx_a) = window[0];
                let (prio_b, idx_b) = window[1];
                prop_assert!(
                    prio_a > prio_b || (prio_a == prio_b && idx_a < idx_b),
                    "priority/FIFO order violated: {:?} then {:?}", window[0], window[1]
                );
            }
            prop_assert_eq!(popped.len(), tags.len());
        }
    }
}

//! Minimum-heap timer queue for optional per-connection timeouts.
//!
//! Wraps `std::collections::BinaryHeap` (a max-heap by default;
//! `Reverse` flips it to a min-heap by deadline) rather than
//! hand-rolling one.
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::time::Instant;

/// Opaque handle returned by `schedule`, usable with `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Entry {
    deadline: Instant,
    seq: u64,
    token: usize,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Firing order for equal deadlines is unspecified but stable:
        // break ties by insertion sequence so the heap's own
        // comparisons never need to skew between pops.
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of `(deadline, token)` pairs, where `token` identifies
/// whatever the reactor wants released when the deadline passes (a
/// context-pool slot index, in this crate). Cancellation is lazy: a
/// cancelled id is recorded and silently skipped when it is popped,
/// rather than removed from the heap's interior.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, token: usize) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            token,
        }));
        TimerId(seq)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id.0);
    }

    /// Deadline of the earliest live timer, used to bound the
    /// reactor's poll timeout.
    ///
    /// `heap.iter()` yields the root first but is otherwise unordered,
    /// so filtering it for the first non-cancelled entry can skip past
    /// a later, still-live deadline sitting behind a cancelled root.
    /// Peeling cancelled entries off the actual root instead — which is
    /// always the heap's minimum — finds the true earliest live
    /// deadline, and permanently discards entries that will never fire
    /// anyway.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.remove(&entry.seq) {
                self.heap.pop();
                continue;
            }
            return Some(entry.deadline);
        }
        None
    }

    /// Pops and returns every token whose deadline is `<= now`,
    /// draining the heap of expired entries.
    pub fn pop_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.seq) {
                continue;
            }
            due.push(entry.token);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.len() == self.cancelled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earlier_deadline_pops_first() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        q.schedule(base + Duration::from_secs(10), 1);
        q.schedule(base + Duration::from_secs(1), 2);
        let due = q.pop_due(base + Duration::from_secs(5));
        assert_eq!(due, vec![2]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        let id = q.schedule(base, 42);
        q.cancel(id);
        let due = q.pop_due(base + Duration::from_secs(1));
        assert!(due.is_empty());
    }

    #[test]
    fn equal_deadlines_are_stable_by_insertion_order() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        q.schedule(base, 1);
        q.schedule(base, 2);
        q.schedule(base, 3);
        assert_eq!(q.pop_due(base), vec![1, 2, 3]);
    }

    #[test]
    fn next_deadline_reflects_earliest_live_timer() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        let id = q.schedule(base + Duration::from_secs(1), 1);
        q.schedule(base + Duration::from_secs(5), 2);
        assert_eq!(q.next_deadline(), Some(base + Duration::from_secs(1)));
        q.cancel(id);
        assert_eq!(q.next_deadline(), Some(base + Duration::from_secs(5)));
    }
}

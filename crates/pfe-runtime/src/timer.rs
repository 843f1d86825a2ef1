#![forbid(unsafe_code)]

//! Deadline queue with cancellable handles.
//!
//! [`TimerQueue`] stores payloads keyed by absolute deadlines. Scheduling
//! returns a [`TimerId`] that can cancel the timer in O(log n) amortized;
//! [`TimerQueue::pop_due`] releases every timer whose deadline has passed,
//! earliest first.
//!
//! The queue never reads the clock. Callers pass `now` explicitly, which
//! keeps escalation deterministic under test.
//!
//! # Invariants
//!
//! - The heap head is always a live timer (cancelled heads are pruned
//!   eagerly), so [`TimerQueue::next_deadline`] is a peek.
//! - Timers with equal deadlines fire in scheduling order.
//! - A fired or cancelled [`TimerId`] is never reused.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest deadline first (min-heap on a max-heap)
        other
            .deadline
            .cmp(&self.deadline)
            // Tie-break: earlier scheduling first
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Min-deadline timer queue.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<HeapEntry>,
    entries: HashMap<TimerId, (Instant, T)>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `payload` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(HeapEntry { deadline, id });
        self.entries.insert(id, (deadline, payload));
        id
    }

    /// Cancel a pending timer, returning its payload if it had not fired.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let (_, payload) = self.entries.remove(&id)?;
        self.prune_head();
        Some(payload)
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek().copied() {
            if head.deadline > now {
                break;
            }
            self.heap.pop();
            if let Some((_, payload)) = self.entries.remove(&head.id) {
                due.push((head.id, payload));
            }
        }
        self.prune_head();
        due
    }

    /// Deadline of the earliest live timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|head| head.deadline)
    }

    /// Deadline of a specific timer, if still armed.
    #[must_use]
    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.entries.get(&id).map(|(deadline, _)| *deadline)
    }

    #[must_use]
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune_head(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.entries.contains_key(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

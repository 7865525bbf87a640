//! Events and the time-ordered event queue.
//!
//! ```text
//!   schedule(t, target, kind) ──► EventId(seq)
//!                                    │
//!                 ┌──────────────────▼───────────────────┐
//!                 │ BinaryHeap ordered by (time, seq)     │
//!                 │ earliest time first, FIFO on ties     │
//!                 └──────────────────┬───────────────────┘
//!                                    │ pop() skips cancelled ids
//!                                    ▼
//!                              Event { id, time_ns, target, kind }
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::types::{EventId, NodeId, TimerId};

// ============================================================================
// Event
// ============================================================================

/// What happens when an event is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind<M> {
    /// Deliver `msg` from `src` to the event's target node.
    Message { src: NodeId, msg: M },
    /// Fire the target node's timer.
    Timer { timer: TimerId },
}

/// A scheduled event. Owned by the queue until dispatch.
#[derive(Debug, Clone)]
pub struct Event<M> {
    /// Unique id; its sequence breaks ties at equal times.
    pub id: EventId,
    /// Virtual time at which the event fires (nanoseconds).
    pub time_ns: u64,
    /// Node the event is addressed to.
    pub target: NodeId,
    pub kind: EventKind<M>,
}

impl<M> Event<M> {
    fn key(&self) -> (u64, EventId) {
        (self.time_ns, self.id)
    }
}

impl<M> PartialEq for Event<M> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<M> Eq for Event<M> {}

impl<M> PartialOrd for Event<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Event<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap; reverse so the earliest (time, seq) pops first.
        other.key().cmp(&self.key())
    }
}

// ============================================================================
// Event Queue
// ============================================================================

/// Priority queue of pending events.
///
/// Cancellation is lazy: a cancelled id is remembered and its event is
/// discarded when it reaches the front of the heap.
#[derive(Debug)]
pub struct EventQueue<M> {
    heap: BinaryHeap<Event<M>>,
    /// Ids still in the heap and not cancelled.
    live: HashSet<EventId>,
    cancelled: HashSet<EventId>,
    next_sequence: u64,
}

impl<M> EventQueue<M> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            next_sequence: 0,
        }
    }

    /// Enqueues an event and returns its id.
    pub fn schedule(&mut self, time_ns: u64, target: NodeId, kind: EventKind<M>) -> EventId {
        let id = EventId::from_sequence(self.next_sequence);
        self.next_sequence += 1;
        self.live.insert(id);
        self.heap.push(Event {
            id,
            time_ns,
            target,
            kind,
        });
        id
    }

    /// Marks a pending event as cancelled. Returns `false` if `id` is not
    /// queued, either because it already fired or was already cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        if !self.live.remove(&id) {
            return false;
        }
        self.cancelled.insert(id);
        true
    }

    /// Removes and returns the earliest live event.
    pub fn pop(&mut self) -> Option<Event<M>> {
        while let Some(event) = self.heap.pop() {
            if self.cancelled.remove(&event.id) {
                continue;
            }
            self.live.remove(&event.id);
            return Some(event);
        }
        None
    }

    /// Returns the time of the earliest live event without removing it.
    pub fn next_time(&mut self) -> Option<u64> {
        loop {
            let id = self.heap.peek()?.id;
            if !self.cancelled.remove(&id) {
                return self.heap.peek().map(|event| event.time_ns);
            }
            self.heap.pop();
        }
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every pending event.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.cancelled.clear();
    }
}

impl<M> Default for EventQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! The node abstraction.
//!
//! A node is a protocol state machine driven by two callbacks: a message
//! arrived, or a timer fired. Everything a handler may do to the outside
//! world (send, arm or cancel timers, bump counters, draw randomness) goes
//! through the [`NodeContext`] handed to it for the duration of one
//! dispatch. Handlers run to completion; anything they schedule is
//! dispatched later, never re-entrantly.

use std::any::Any;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::event::{EventKind, EventQueue};
use crate::network::{SendResult, SimNetwork};
use crate::rng::SimRng;
use crate::types::{EventId, NodeId, TimerId};

/// Pending timer events, keyed by owner and name.
pub(crate) type TimerTable = BTreeMap<(NodeId, TimerId), EventId>;

// ============================================================================
// Node Trait
// ============================================================================

/// A simulated process.
///
/// `M` is the message type exchanged by the nodes of one simulation.
pub trait Node<M>: Any {
    fn id(&self) -> NodeId;

    /// Called once when the simulation starts (or when the node is
    /// registered into a running simulation).
    fn on_start(&mut self, _ctx: &mut NodeContext<'_, M>) {}

    fn on_message(&mut self, ctx: &mut NodeContext<'_, M>, src: NodeId, msg: M);

    fn on_timer(&mut self, ctx: &mut NodeContext<'_, M>, timer: TimerId);

    /// Persistent key-value state, used for determinism checks and metrics.
    fn store(&self) -> &Store;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ============================================================================
// Counters
// ============================================================================

/// Per-node counters. Owned by the simulation so they survive a crash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounters {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Messages the node did not understand and dropped.
    pub messages_ignored: u64,
    pub commit_count: u64,
}

// ============================================================================
// Store
// ============================================================================

/// A node's persistent key-value store.
///
/// Values are JSON so that arbitrary protocol state can be kept and the whole
/// store serialized canonically (keys are sorted).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Store {
    entries: BTreeMap<String, serde_json::Value>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and decodes `key`; `Ok(None)` if it was never written.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.entries
            .get(key)
            .map(|value| {
                T::deserialize(value).map_err(|source| SimError::Store {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Encodes `value` and writes it under `key`.
    pub fn put<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value).map_err(|source| SimError::Store {
            key: key.to_string(),
            source,
        })?;
        self.entries.insert(key.to_string(), encoded);
        Ok(())
    }

    pub fn raw(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical JSON encoding of the whole store.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A map of JSON values with string keys always serializes.
        serde_json::to_vec(&self.entries).unwrap_or_default()
    }
}

// ============================================================================
// Dispatch Context
// ============================================================================

/// What a handler can reach during one dispatch.
pub struct NodeContext<'a, M> {
    id: NodeId,
    now_ns: u64,
    events: &'a mut EventQueue<M>,
    network: &'a mut SimNetwork,
    rng: &'a mut SimRng,
    counters: &'a mut NodeCounters,
    timers: &'a mut TimerTable,
}

impl<'a, M> NodeContext<'a, M> {
    pub(crate) fn new(
        id: NodeId,
        now_ns: u64,
        events: &'a mut EventQueue<M>,
        network: &'a mut SimNetwork,
        rng: &'a mut SimRng,
        counters: &'a mut NodeCounters,
        timers: &'a mut TimerTable,
    ) -> Self {
        Self {
            id,
            now_ns,
            events,
            network,
            rng,
            counters,
            timers,
        }
    }

    /// The node being dispatched to.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.now_ns
    }

    /// The simulation's shared deterministic RNG.
    pub fn rng(&mut self) -> &mut SimRng {
        &mut *self.rng
    }

    pub fn counters(&self) -> &NodeCounters {
        &*self.counters
    }

    /// Best-effort asynchronous send. Never blocks or fails; the fate of the
    /// message is returned for callers that care.
    pub fn send(&mut self, dst: NodeId, msg: M) -> SendResult {
        let result = self.network.send(self.id, dst, self.now_ns, self.rng);
        self.enqueue_delivery(dst, msg, result);
        result
    }

    /// Sends `msg` to every node in `dsts`.
    pub fn broadcast<'n>(&mut self, dsts: impl IntoIterator<Item = &'n NodeId>, msg: &M)
    where
        M: Clone,
    {
        for dst in dsts {
            self.send(*dst, msg.clone());
        }
    }

    /// Bounded-latency send. The timeout is advisory: an overrun is flagged
    /// in the result but the message is still delivered.
    pub fn sync_send(&mut self, dst: NodeId, msg: M, timeout_ns: Option<u64>) -> SendResult {
        let result = self
            .network
            .sync_send(self.id, dst, timeout_ns, self.now_ns, self.rng);
        self.enqueue_delivery(dst, msg, result);
        result
    }

    fn enqueue_delivery(&mut self, dst: NodeId, msg: M, result: SendResult) {
        self.counters.messages_sent += 1;
        if let Some(deliver_at_ns) = result.deliver_at() {
            self.events.schedule(
                deliver_at_ns,
                dst,
                EventKind::Message { src: self.id, msg },
            );
        }
    }

    /// Arms `timer` to fire after `delay_ns`. Re-arming a pending timer
    /// cancels the earlier instance.
    pub fn set_timer(&mut self, delay_ns: u64, timer: TimerId) -> EventId {
        let id = self.events.schedule(
            self.now_ns.saturating_add(delay_ns),
            self.id,
            EventKind::Timer { timer },
        );
        if let Some(previous) = self.timers.insert((self.id, timer), id) {
            self.events.cancel(previous);
        }
        id
    }

    /// Cancels `timer`. Returns `false` if it was not pending.
    pub fn cancel_timer(&mut self, timer: TimerId) -> bool {
        self.timers
            .remove(&(self.id, timer))
            .is_some_and(|event| self.events.cancel(event))
    }

    /// Whether `timer` is armed and has not fired yet.
    pub fn timer_pending(&self, timer: TimerId) -> bool {
        self.timers.contains_key(&(self.id, timer))
    }

    pub fn record_commit(&mut self) {
        self.counters.commit_count += 1;
    }

    /// Counts a message the node does not understand.
    pub fn record_unknown_message(&mut self) {
        self.counters.messages_ignored += 1;
    }

    pub(crate) fn record_received(&mut self) {
        self.counters.messages_received += 1;
    }
}

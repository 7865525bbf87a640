//! The scheduler: virtual time, the event queue, and dispatch to nodes.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::clock::SimClock;
use crate::error::{Result, SimError};
use crate::event::{Event, EventKind, EventQueue};
use crate::network::{NetworkStats, SimNetwork};
use crate::node::{Node, NodeContext, NodeCounters, TimerTable};
use crate::rng::SimRng;
use crate::types::{EventId, NodeId};

/// Default cap on dispatched events per simulation.
pub const DEFAULT_MAX_EVENTS: u64 = 10_000_000;

// ============================================================================
// Simulation Configuration
// ============================================================================

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Seed for the deterministic RNG.
    pub seed: u64,
    /// Maximum number of events to process.
    pub max_events: u64,
    /// Whether to record a dispatch trace.
    pub trace_enabled: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_events: DEFAULT_MAX_EVENTS,
            trace_enabled: false,
        }
    }
}

impl SimConfig {
    /// Sets the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the maximum number of events.
    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = max_events;
        self
    }

    /// Enables the dispatch trace.
    pub fn with_tracing(mut self) -> Self {
        self.trace_enabled = true;
        self
    }
}

// ============================================================================
// Trace
// ============================================================================

/// One dispatched event, as recorded by the dispatch trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub time_ns: u64,
    pub sequence: u64,
    pub target: NodeId,
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceKind {
    /// A message delivery; `detail` is the message's `Debug` rendering.
    Message { src: NodeId, detail: String },
    Timer { timer: &'static str },
}

impl TraceEntry {
    fn of<M: fmt::Debug>(event: &Event<M>) -> Self {
        let kind = match &event.kind {
            EventKind::Message { src, msg } => TraceKind::Message {
                src: *src,
                detail: format!("{msg:?}"),
            },
            EventKind::Timer { timer } => TraceKind::Timer {
                timer: timer.name(),
            },
        };
        Self {
            time_ns: event.time_ns,
            sequence: event.id.sequence(),
            target: event.target,
            kind,
        }
    }

    /// The message rendering, for message deliveries.
    pub fn message(&self) -> Option<&str> {
        match &self.kind {
            TraceKind::Message { detail, .. } => Some(detail),
            TraceKind::Timer { .. } => None,
        }
    }
}

// ============================================================================
// Simulation
// ============================================================================

/// A deterministic discrete-event simulation over nodes exchanging `M`.
///
/// Given the same seed and the same sequence of calls, two simulations
/// dispatch the same events in the same order and end in the same state.
pub struct Simulation<M> {
    config: SimConfig,
    clock: SimClock,
    events: EventQueue<M>,
    network: SimNetwork,
    rng: SimRng,
    nodes: BTreeMap<NodeId, Box<dyn Node<M>>>,
    /// Outlives crashes so metrics stay readable.
    counters: BTreeMap<NodeId, NodeCounters>,
    timers: TimerTable,
    started: bool,
    events_processed: u64,
    events_dropped: u64,
    trace: Vec<TraceEntry>,
}

impl<M: fmt::Debug + 'static> Simulation<M> {
    pub fn new(config: SimConfig, network: SimNetwork) -> Self {
        let rng = SimRng::new(config.seed);
        Self {
            config,
            clock: SimClock::new(),
            events: EventQueue::new(),
            network,
            rng,
            nodes: BTreeMap::new(),
            counters: BTreeMap::new(),
            timers: TimerTable::new(),
            started: false,
            events_processed: 0,
            events_dropped: 0,
            trace: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Mutable network access, for injecting partitions between runs.
    pub fn network_mut(&mut self) -> &mut SimNetwork {
        &mut self.network
    }

    pub fn rng_mut(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    pub fn node(&self, id: NodeId) -> Option<&dyn Node<M>> {
        self.nodes.get(&id).map(AsRef::as_ref)
    }

    /// The live node `id`, downcast to its concrete type.
    pub fn node_as<T: 'static>(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(&id)?.as_any().downcast_ref::<T>()
    }

    /// Ids of live nodes, ascending.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Counters of `id`, including nodes that have crashed.
    pub fn counters(&self, id: NodeId) -> Option<&NodeCounters> {
        self.counters.get(&id)
    }

    /// The dispatch trace (empty unless tracing is enabled).
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Adds a node. If the simulation has started, the node's `on_start`
    /// runs immediately.
    pub fn register_node(&mut self, node: Box<dyn Node<M>>) -> Result<()> {
        let id = node.id();
        if self.nodes.contains_key(&id) {
            return Err(SimError::configuration(format!(
                "node {id} is already registered"
            )));
        }
        self.nodes.insert(id, node);
        self.counters.entry(id).or_default();
        tracing::debug!(node = %id, "node registered");

        if self.started {
            self.with_node(id, |node, ctx| node.on_start(ctx));
        }
        Ok(())
    }

    /// Crashes node `id` (fail-stop). Pending events addressed to it will be
    /// dropped; its counters remain readable.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Box<dyn Node<M>>> {
        let node = self.nodes.remove(&id)?;
        let mut forgotten = Vec::new();
        self.timers.retain(|(owner, _), event| {
            if *owner == id {
                forgotten.push(*event);
                false
            } else {
                true
            }
        });
        for event in forgotten {
            self.events.cancel(event);
        }
        tracing::info!(node = %id, "node crashed");
        Some(node)
    }

    /// Runs `f` against node `id` with a dispatch context at the current
    /// time, as if the node were handling an event. Returns `None` if the
    /// node is not live.
    pub fn with_node<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut dyn Node<M>, &mut NodeContext<'_, M>) -> R,
    ) -> Option<R> {
        let node = self.nodes.get_mut(&id)?;
        let counters = self.counters.entry(id).or_default();
        let mut ctx = NodeContext::new(
            id,
            self.clock.now(),
            &mut self.events,
            &mut self.network,
            &mut self.rng,
            counters,
            &mut self.timers,
        );
        Some(f(node.as_mut(), &mut ctx))
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Enqueues an event directly, bypassing the network.
    pub fn schedule(
        &mut self,
        time_ns: u64,
        target: NodeId,
        kind: EventKind<M>,
    ) -> Result<EventId> {
        if time_ns < self.clock.now() {
            return Err(SimError::configuration(format!(
                "cannot schedule an event at {time_ns} ns, the clock is already at {} ns",
                self.clock.now()
            )));
        }
        Ok(self.events.schedule(time_ns, target, kind))
    }

    /// Invokes every node's `on_start` once, in ascending id order.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.with_node(id, |node, ctx| node.on_start(ctx));
        }
    }

    /// Dispatches exactly one event. Returns its id, or `None` when the
    /// queue is empty or the event limit has been reached.
    pub fn step(&mut self) -> Option<EventId> {
        if self.events_processed >= self.config.max_events {
            return None;
        }
        self.start();
        let event = self.events.pop()?;
        let id = event.id;
        self.dispatch(event);
        Some(id)
    }

    /// Runs until the queue drains, the event limit is hit, or the next
    /// event lies beyond `until_ns`. Events beyond the limit stay queued and
    /// the clock does not move past them.
    pub fn run(&mut self, until_ns: Option<u64>) -> SimSummary {
        self.start();
        loop {
            if self.events_processed >= self.config.max_events {
                tracing::warn!(
                    max_events = self.config.max_events,
                    "event limit reached, stopping run"
                );
                break;
            }
            let Some(next_ns) = self.events.next_time() else {
                break;
            };
            if until_ns.is_some_and(|until| next_ns > until) {
                break;
            }
            if let Some(event) = self.events.pop() {
                self.dispatch(event);
            }
        }
        self.summary()
    }

    /// Shorthand for `run(Some(until_ns))`.
    pub fn run_until(&mut self, until_ns: u64) -> SimSummary {
        self.run(Some(until_ns))
    }

    fn dispatch(&mut self, event: Event<M>) {
        self.clock.advance_to(event.time_ns);
        self.events_processed += 1;
        if self.config.trace_enabled {
            self.trace.push(TraceEntry::of(&event));
        }

        let Event {
            id, target, kind, ..
        } = event;

        if let EventKind::Timer { timer } = &kind {
            if self.timers.get(&(target, *timer)) == Some(&id) {
                self.timers.remove(&(target, *timer));
            }
        }

        tracing::trace!(event = %id, node = %target, time_ns = self.clock.now(), "dispatch");
        let delivered = self.with_node(target, |node, ctx| match kind {
            EventKind::Message { src, msg } => {
                ctx.record_received();
                node.on_message(ctx, src, msg);
            }
            EventKind::Timer { timer } => node.on_timer(ctx, timer),
        });

        if delivered.is_none() {
            self.events_dropped += 1;
            tracing::debug!(event = %id, node = %target, "dropped event for absent node");
        }
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    pub fn summary(&self) -> SimSummary {
        SimSummary {
            events_processed: self.events_processed,
            events_dropped: self.events_dropped,
            final_time_ns: self.clock.now(),
            seed: self.config.seed,
            hit_event_limit: self.events_processed >= self.config.max_events,
        }
    }

    /// Network statistics and per-node counters at the current time.
    pub fn metrics(&self) -> MetricsSnapshot {
        let network = self.network.stats().clone();
        MetricsSnapshot {
            time_ns: self.clock.now(),
            loss_rate: network.loss_rate(),
            network,
            nodes: self.counters.clone(),
        }
    }
}

// ============================================================================
// Simulation Summary
// ============================================================================

/// Summary of a simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimSummary {
    /// Total number of events dispatched (including dropped ones).
    pub events_processed: u64,
    /// Events addressed to nodes that were not live.
    pub events_dropped: u64,
    /// Virtual time of the last dispatched event (nanoseconds).
    pub final_time_ns: u64,
    /// Seed used for this run.
    pub seed: u64,
    pub hit_event_limit: bool,
}

/// Serializable metrics for an external harness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub time_ns: u64,
    pub network: NetworkStats,
    pub loss_rate: f64,
    pub nodes: BTreeMap<NodeId, NodeCounters>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;
    use crate::node::Store;
    use crate::types::TimerId;

    const TICK: TimerId = TimerId::new("tick");

    /// Echoes pings and records everything it sees.
    struct Echo {
        id: NodeId,
        seen: Vec<(u64, String)>,
        store: Store,
    }

    impl Echo {
        fn boxed(id: u64) -> Box<dyn Node<String>> {
            Box::new(Self {
                id: NodeId::new(id),
                seen: Vec::new(),
                store: Store::new(),
            })
        }
    }

    impl Node<String> for Echo {
        fn id(&self) -> NodeId {
            self.id
        }

        fn on_message(&mut self, ctx: &mut NodeContext<'_, String>, src: NodeId, msg: String) {
            self.seen.push((ctx.now(), msg.clone()));
            if msg == "ping" {
                ctx.send(src, "pong".to_string());
            }
        }

        fn on_timer(&mut self, ctx: &mut NodeContext<'_, String>, timer: TimerId) {
            self.seen.push((ctx.now(), format!("timer:{timer}")));
        }

        fn store(&self) -> &Store {
            &self.store
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn message(src: u64, msg: &str) -> EventKind<String> {
        EventKind::Message {
            src: NodeId::new(src),
            msg: msg.to_string(),
        }
    }

    fn seen(sim: &Simulation<String>, id: u64) -> Vec<(u64, String)> {
        sim.node_as::<Echo>(NodeId::new(id)).unwrap().seen.clone()
    }

    fn sim() -> Simulation<String> {
        let mut sim = Simulation::new(SimConfig::default().with_seed(42), SimNetwork::reliable());
        sim.register_node(Echo::boxed(0)).unwrap();
        sim.register_node(Echo::boxed(1)).unwrap();
        sim
    }

    #[test]
    fn dispatches_in_time_order() {
        let mut sim = sim();
        sim.schedule(3_000, NodeId::new(0), message(1, "c")).unwrap();
        sim.schedule(1_000, NodeId::new(0), message(1, "a")).unwrap();
        sim.schedule(2_000, NodeId::new(0), message(1, "b")).unwrap();

        let summary = sim.run(None);
        assert_eq!(summary.events_processed, 3);
        assert_eq!(summary.final_time_ns, 3_000);
        let order: Vec<String> = seen(&sim, 0).into_iter().map(|(_, m)| m).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_times_dispatch_fifo() {
        let mut sim = sim();
        for msg in ["first", "second", "third"] {
            sim.schedule(500, NodeId::new(1), message(0, msg)).unwrap();
        }
        sim.run(None);
        let order: Vec<String> = seen(&sim, 1).into_iter().map(|(_, m)| m).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn scheduling_in_the_past_is_rejected() {
        let mut sim = sim();
        sim.schedule(5_000, NodeId::new(0), message(1, "x")).unwrap();
        sim.run(None);
        let err = sim.schedule(1_000, NodeId::new(0), message(1, "late"));
        assert!(matches!(err, Err(SimError::Configuration(_))));
    }

    #[test]
    fn run_until_leaves_later_events_queued() {
        let mut sim = sim();
        sim.schedule(1_000, NodeId::new(0), message(1, "early")).unwrap();
        sim.schedule(9_000, NodeId::new(0), message(1, "late")).unwrap();

        let summary = sim.run_until(5_000);
        assert_eq!(summary.events_processed, 1);
        assert!(sim.now() <= 5_000);
        assert_eq!(sim.pending_events(), 1);

        sim.run(None);
        assert_eq!(seen(&sim, 0).len(), 2);
    }

    #[test]
    fn ping_pong_goes_through_the_network() {
        let mut sim = sim();
        sim.schedule(0, NodeId::new(1), message(0, "ping")).unwrap();
        sim.run(None);

        // Reliable network: 1 ms travel plus 0.05 ms switch processing.
        assert_eq!(seen(&sim, 0), vec![(1_050_000, "pong".to_string())]);
        let counters = sim.counters(NodeId::new(1)).unwrap();
        assert_eq!(counters.messages_received, 1);
        assert_eq!(counters.messages_sent, 1);
        assert_eq!(sim.network().stats().messages_delivered, 1);
    }

    #[test]
    fn crashed_node_events_are_dropped() {
        let mut sim = sim();
        sim.schedule(100, NodeId::new(1), message(0, "ping")).unwrap();
        assert!(sim.remove_node(NodeId::new(1)).is_some());

        let summary = sim.run(None);
        assert_eq!(summary.events_processed, 1);
        assert_eq!(summary.events_dropped, 1);
        assert!(seen(&sim, 0).is_empty());
        assert!(sim.counters(NodeId::new(1)).is_some());
    }

    #[test]
    fn rearming_a_timer_replaces_it() {
        let mut sim = sim();
        sim.with_node(NodeId::new(0), |_, ctx| {
            ctx.set_timer(1_000, TICK);
            ctx.set_timer(5_000, TICK);
        });
        sim.run(None);
        assert_eq!(seen(&sim, 0), vec![(5_000, "timer:tick".to_string())]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut sim = sim();
        let cancelled = sim
            .with_node(NodeId::new(0), |_, ctx| {
                ctx.set_timer(1_000, TICK);
                ctx.cancel_timer(TICK)
            })
            .unwrap();
        assert!(cancelled);
        let again = sim.with_node(NodeId::new(0), |_, ctx| ctx.cancel_timer(TICK));
        assert_eq!(again, Some(false));

        let summary = sim.run(None);
        assert_eq!(summary.events_processed, 0);
        assert!(seen(&sim, 0).is_empty());
    }

    #[test]
    fn timer_past_the_end_of_time_saturates() {
        let mut sim = sim();
        sim.schedule(1_000, NodeId::new(0), message(1, "x")).unwrap();
        sim.run(None);
        sim.with_node(NodeId::new(0), |_, ctx| ctx.set_timer(u64::MAX, TICK));

        sim.run(None);
        let last = seen(&sim, 0).pop();
        assert_eq!(last, Some((u64::MAX, "timer:tick".to_string())));
    }

    #[test]
    fn timers_are_scoped_per_node() {
        let mut sim = sim();
        for id in [0, 1] {
            sim.with_node(NodeId::new(id), |_, ctx| ctx.set_timer(2_000, TICK));
        }
        sim.run(None);
        assert_eq!(seen(&sim, 0).len(), 1);
        assert_eq!(seen(&sim, 1).len(), 1);
    }

    #[test]
    fn event_limit_stops_the_run() {
        let mut sim = Simulation::new(
            SimConfig::default().with_max_events(2),
            SimNetwork::reliable(),
        );
        sim.register_node(Echo::boxed(0)).unwrap();
        for t in 1..=5 {
            sim.schedule(t, NodeId::new(0), message(9, "x")).unwrap();
        }
        let summary = sim.run(None);
        assert_eq!(summary.events_processed, 2);
        assert!(summary.hit_event_limit);
        assert!(sim.step().is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut sim = sim();
        assert!(matches!(
            sim.register_node(Echo::boxed(0)),
            Err(SimError::Configuration(_))
        ));
    }

    #[test]
    fn trace_records_dispatch_order() {
        let mut sim = Simulation::new(
            SimConfig::default().with_tracing(),
            SimNetwork::reliable(),
        );
        sim.register_node(Echo::boxed(0)).unwrap();
        sim.schedule(10, NodeId::new(0), message(3, "hello")).unwrap();
        sim.with_node(NodeId::new(0), |_, ctx| ctx.set_timer(20, TICK));
        sim.run(None);

        let trace = sim.trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].message(), Some("\"hello\""));
        assert_eq!(trace[1].kind, TraceKind::Timer { timer: "tick" });
    }

    #[test]
    fn metrics_snapshot_serializes() {
        let mut sim = sim();
        sim.schedule(0, NodeId::new(1), message(0, "ping")).unwrap();
        sim.run(None);
        let json = serde_json::to_value(sim.metrics()).unwrap();
        assert_eq!(json["network"]["messages_sent"], 1);
        assert_eq!(json["nodes"]["1"]["messages_sent"], 1);
    }
}

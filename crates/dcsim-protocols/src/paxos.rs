//! Multi-role Paxos.
//!
//! Every node is at once proposer, acceptor and learner. One elected leader
//! drives one round at a time, each round deciding the lowest instance
//! (log slot) the leader has not yet seen decided.
//!
//! ```text
//!   Client        Leader (proposer)           Acceptors              Learners (all)
//!     │ Request ──►│ pending.push_back
//!     │            │── Prepare(i, b) ─────────►│ b > promised?
//!     │            │◄──────────── Promise ─────│   yes: promise   / no: Nack(promised)
//!     │            │ quorum: pick value
//!     │            │── Accept(i, b, v) ───────►│ b ≥ promised?
//!     │            │                           │── Learn(i, b, v) ──────►│ quorum of
//!     │◄────────────────────────────── Reply(Committed) ─────────────────│ acceptors
//! ```
//!
//! Leadership is driven by a randomized election timer and leader heartbeats.
//! Ballots start at the node's position in the cluster and step by the
//! cluster size, so two proposers never share a ballot.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use dcsim_sim::{Node, NodeContext, NodeId, NodeSpec, Result, SimError, Store, TimerId, ms_to_ns};
use serde::{Deserialize, Serialize};

use crate::message::{
    Ballot, Command, Instance, Message, PaxosMessage, Proposal, Reply, ReplyStatus, Request, Value,
};

/// Armed on every node; expiry makes a follower run for leader.
pub const ELECTION_TIMER: TimerId = TimerId::new("election");
/// Armed only while leading.
pub const HEARTBEAT_TIMER: TimerId = TimerId::new("heartbeat");

/// Store key of the durable [`AcceptorState`].
pub const ACCEPTOR_KEY: &str = "acceptor";
/// Store key of the decided log (instance → value).
pub const DECIDED_KEY: &str = "decided";

// ============================================================================
// Configuration
// ============================================================================

/// Paxos parameters, settable through registry overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PaxosConfig {
    pub heartbeat_interval_ms: f64,
    pub election_timeout_ms: f64,
    /// Upper bound of the uniform jitter added to every election timeout.
    pub election_jitter_ms: f64,
    /// Fixed leader installed at start; others learn it immediately.
    pub initial_leader: Option<NodeId>,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50.0,
            election_timeout_ms: 200.0,
            election_jitter_ms: 100.0,
            initial_leader: None,
        }
    }
}

impl PaxosConfig {
    pub fn with_initial_leader(mut self, leader: NodeId) -> Self {
        self.initial_leader = Some(leader);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("election_timeout_ms", self.election_timeout_ms),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SimError::Configuration(format!(
                    "{name} must be finite and positive, got {value}"
                )));
            }
        }
        if !self.election_jitter_ms.is_finite() || self.election_jitter_ms < 0.0 {
            return Err(SimError::Configuration(format!(
                "election_jitter_ms must be finite and non-negative, got {}",
                self.election_jitter_ms
            )));
        }
        Ok(())
    }
}

// ============================================================================
// State
// ============================================================================

/// Durable acceptor state, written through to the store on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptorState {
    /// Highest ballot promised. Never decreases.
    pub promised: Ballot,
    /// Last proposal accepted, per instance.
    pub accepted: BTreeMap<Instance, Proposal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preparing,
    Accepting,
}

/// The leader's in-flight round.
#[derive(Debug, Clone, Copy)]
struct Round {
    instance: Instance,
    ballot: Ballot,
    phase: Phase,
}

/// A Paxos participant.
pub struct PaxosNode {
    id: NodeId,
    /// Every server, sorted, including this one.
    cluster: Vec<NodeId>,
    /// Every server except this one.
    peers: Vec<NodeId>,
    quorum: usize,
    heartbeat_interval_ns: u64,
    election_timeout_ns: u64,
    election_jitter_ns: u64,
    initial_leader: Option<NodeId>,
    store: Store,

    // Acceptor
    acceptor: AcceptorState,

    // Proposer
    is_leader: bool,
    leader: Option<NodeId>,
    ballot: Ballot,
    /// The ballot was just advanced by winning leadership and is unused.
    fresh_ballot: bool,
    round: Option<Round>,
    pending: VecDeque<Command>,
    /// Promises for the current round, by acceptor.
    promises: BTreeMap<NodeId, Option<Proposal>>,

    // Learner
    learned: BTreeMap<(Instance, Ballot, Value), BTreeSet<NodeId>>,
    decided: BTreeMap<Instance, Value>,
    decided_commands: BTreeSet<(NodeId, u64)>,
}

impl PaxosNode {
    pub fn new(id: NodeId, all_nodes: &[NodeId], config: PaxosConfig) -> Result<Self> {
        config.validate()?;

        let mut cluster = all_nodes.to_vec();
        cluster.sort_unstable();
        cluster.dedup();
        let position = cluster.iter().position(|node| *node == id).ok_or_else(|| {
            SimError::Configuration(format!("node {id} is not a member of the cluster"))
        })?;
        if let Some(leader) = config.initial_leader {
            if !cluster.contains(&leader) {
                return Err(SimError::Configuration(format!(
                    "initial_leader {leader} is not a member of the cluster"
                )));
            }
        }

        let peers = cluster.iter().copied().filter(|node| *node != id).collect();
        let quorum = cluster.len() / 2 + 1;

        Ok(Self {
            id,
            peers,
            quorum,
            heartbeat_interval_ns: ms_to_ns(config.heartbeat_interval_ms),
            election_timeout_ns: ms_to_ns(config.election_timeout_ms),
            election_jitter_ns: ms_to_ns(config.election_jitter_ms),
            initial_leader: config.initial_leader,
            store: Store::new(),
            acceptor: AcceptorState::default(),
            is_leader: false,
            leader: None,
            ballot: Ballot::new(position as u64),
            fresh_ballot: false,
            round: None,
            pending: VecDeque::new(),
            promises: BTreeMap::new(),
            learned: BTreeMap::new(),
            decided: BTreeMap::new(),
            decided_commands: BTreeSet::new(),
            cluster,
        })
    }

    /// Registry constructor.
    pub fn from_spec(spec: NodeSpec<'_>) -> Result<Box<dyn Node<Message>>> {
        let config: PaxosConfig = spec.params()?;
        Ok(Box::new(Self::new(spec.node_id, spec.all_nodes, config)?))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// The leader this node currently believes in.
    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// This node's proposer ballot.
    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn promised_ballot(&self) -> Ballot {
        self.acceptor.promised
    }

    pub fn accepted(&self, instance: Instance) -> Option<&Proposal> {
        self.acceptor.accepted.get(&instance)
    }

    /// Decided values, by instance.
    pub fn decided(&self) -> &BTreeMap<Instance, Value> {
        &self.decided
    }

    /// Whether a command from `client` with `request_id` has been decided.
    pub fn is_decided(&self, client: NodeId, request_id: u64) -> bool {
        self.decided_commands.contains(&(client, request_id))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum
    }

    fn cluster_size(&self) -> u64 {
        self.cluster.len() as u64
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    fn persist_acceptor(&mut self) {
        if let Err(error) = self.store.put(ACCEPTOR_KEY, &self.acceptor) {
            tracing::error!(node = %self.id, %error, "failed to persist acceptor state");
        }
    }

    fn persist_decided(&mut self) {
        if let Err(error) = self.store.put(DECIDED_KEY, &self.decided) {
            tracing::error!(node = %self.id, %error, "failed to persist decided log");
        }
    }

    fn set_promised(&mut self, ballot: Ballot) {
        assert!(
            ballot >= self.acceptor.promised,
            "node {}: promised ballot must never decrease ({} -> {})",
            self.id,
            self.acceptor.promised,
            ballot
        );
        self.acceptor.promised = ballot;
        self.persist_acceptor();
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn reset_election_timer(&self, ctx: &mut NodeContext<'_, Message>) {
        let jitter = ctx.rng().uniform(0.0, self.election_jitter_ns as f64) as u64;
        ctx.set_timer(self.election_timeout_ns + jitter, ELECTION_TIMER);
    }

    fn on_election_timeout(&mut self, ctx: &mut NodeContext<'_, Message>) {
        if !self.is_leader {
            tracing::info!(node = %self.id, leader = ?self.leader, "election timeout");
            self.become_leader(ctx);
        } else if let Some(round) = self.round {
            tracing::debug!(
                node = %self.id,
                instance = round.instance,
                ballot = %round.ballot,
                "round stalled, retrying with a higher ballot"
            );
            self.round = None;
            self.start_round(ctx);
        }
        self.reset_election_timer(ctx);
    }

    fn on_heartbeat_timer(&mut self, ctx: &mut NodeContext<'_, Message>) {
        if !self.is_leader {
            return;
        }
        let heartbeat = Message::Paxos(PaxosMessage::Heartbeat {
            leader: self.id,
            ballot: self.ballot,
        });
        ctx.broadcast(&self.peers, &heartbeat);
        ctx.set_timer(self.heartbeat_interval_ns, HEARTBEAT_TIMER);
    }

    // ------------------------------------------------------------------------
    // Leadership
    // ------------------------------------------------------------------------

    fn advance_ballot_past(&mut self, floor: Ballot) {
        let step = self.cluster_size();
        while self.ballot <= floor {
            self.ballot = self.ballot.advance(step);
        }
    }

    fn become_leader(&mut self, ctx: &mut NodeContext<'_, Message>) {
        self.is_leader = true;
        self.leader = Some(self.id);
        self.ballot = self.ballot.advance(self.cluster_size());
        self.advance_ballot_past(self.acceptor.promised);
        self.fresh_ballot = true;
        self.round = None;
        self.promises.clear();
        tracing::info!(node = %self.id, ballot = %self.ballot, "became leader");

        ctx.set_timer(self.heartbeat_interval_ns, HEARTBEAT_TIMER);
        self.try_start_round(ctx);
    }

    fn step_down(&mut self, ctx: &mut NodeContext<'_, Message>) {
        tracing::info!(node = %self.id, ballot = %self.ballot, "stepping down");
        self.is_leader = false;
        self.leader = None;
        self.round = None;
        self.promises.clear();
        ctx.cancel_timer(HEARTBEAT_TIMER);
        self.reset_election_timer(ctx);
    }

    /// Hands commands left over from a lost leadership to the known leader,
    /// once. Followers keep no retry queue.
    fn hand_off_pending(&mut self, ctx: &mut NodeContext<'_, Message>) {
        if self.is_leader || self.pending.is_empty() {
            return;
        }
        let Some(leader) = self.leader.filter(|leader| *leader != self.id) else {
            return;
        };
        for command in self.pending.drain(..) {
            if self.decided_commands.contains(&command.key()) {
                continue;
            }
            tracing::debug!(
                node = %self.id,
                %leader,
                client = %command.client_id,
                request = command.request_id,
                "handing off pending command"
            );
            ctx.send(leader, Message::Request(command.into()));
        }
    }

    // ------------------------------------------------------------------------
    // Proposer
    // ------------------------------------------------------------------------

    fn on_request(&mut self, ctx: &mut NodeContext<'_, Message>, request: Request) {
        let command = Command::from(request);
        if self.decided_commands.contains(&command.key()) {
            tracing::debug!(
                node = %self.id,
                client = %command.client_id,
                request = command.request_id,
                "request already decided"
            );
            return;
        }

        if !self.is_leader {
            match self.leader.filter(|leader| *leader != self.id) {
                Some(leader) => {
                    ctx.send(leader, Message::Request(command.into()));
                }
                None => {
                    tracing::warn!(
                        node = %self.id,
                        client = %command.client_id,
                        request = command.request_id,
                        "no known leader, dropping request"
                    );
                }
            }
            return;
        }

        if !self.pending.contains(&command) {
            self.pending.push_back(command);
        }
        self.try_start_round(ctx);
    }

    /// Lowest instance not yet seen decided.
    fn next_instance(&self) -> Instance {
        let mut instance = 0;
        for decided in self.decided.keys() {
            if *decided != instance {
                break;
            }
            instance += 1;
        }
        instance
    }

    fn try_start_round(&mut self, ctx: &mut NodeContext<'_, Message>) {
        if !self.is_leader || self.round.is_some() {
            return;
        }
        let decided = &self.decided_commands;
        self.pending.retain(|command| !decided.contains(&command.key()));
        if self.pending.is_empty() {
            return;
        }
        self.start_round(ctx);
    }

    fn start_round(&mut self, ctx: &mut NodeContext<'_, Message>) {
        if !self.fresh_ballot {
            self.ballot = self.ballot.advance(self.cluster_size());
        }
        self.fresh_ballot = false;
        self.advance_ballot_past(self.acceptor.promised);

        let instance = self.next_instance();
        let ballot = self.ballot;
        self.round = Some(Round {
            instance,
            ballot,
            phase: Phase::Preparing,
        });
        self.promises.clear();
        tracing::debug!(node = %self.id, instance, %ballot, "starting round");

        let prepare = Message::Paxos(PaxosMessage::Prepare { instance, ballot });
        ctx.broadcast(&self.peers, &prepare);

        // The leader's own acceptor promises locally.
        self.set_promised(ballot);
        let own = self.acceptor.accepted.get(&instance).cloned();
        self.collect_promise(ctx, self.id, instance, ballot, own);
    }

    fn collect_promise(
        &mut self,
        ctx: &mut NodeContext<'_, Message>,
        acceptor: NodeId,
        instance: Instance,
        ballot: Ballot,
        accepted: Option<Proposal>,
    ) {
        let Some(round) = self.round else {
            return;
        };
        if !self.is_leader
            || round.instance != instance
            || round.ballot != ballot
            || round.phase != Phase::Preparing
        {
            return;
        }

        self.promises.insert(acceptor, accepted);
        if self.promises.len() < self.quorum {
            return;
        }

        let value = self.choose_value();
        self.round = Some(Round {
            phase: Phase::Accepting,
            ..round
        });
        tracing::debug!(node = %self.id, instance, %ballot, ?value, "promise quorum reached");

        let accept = Message::Paxos(PaxosMessage::Accept {
            instance,
            ballot,
            value,
        });
        ctx.broadcast(&self.cluster, &accept);
    }

    /// Highest-ballot accepted value among the promises, else the oldest
    /// pending command, else a no-op.
    fn choose_value(&self) -> Value {
        if let Some(proposal) = self
            .promises
            .values()
            .flatten()
            .max_by_key(|proposal| proposal.ballot)
        {
            return proposal.value.clone();
        }
        match self.pending.front() {
            Some(command) => Value::Command(command.clone()),
            None => Value::Noop {
                ballot: self.ballot,
            },
        }
    }

    fn on_nack(&mut self, ctx: &mut NodeContext<'_, Message>, ballot: Ballot) {
        let Some(round) = self.round else {
            return;
        };
        if !self.is_leader || ballot <= round.ballot {
            return;
        }
        tracing::debug!(
            node = %self.id,
            ours = %round.ballot,
            theirs = %ballot,
            "round rejected by a higher ballot"
        );
        self.advance_ballot_past(ballot);
        self.step_down(ctx);
    }

    fn on_heartbeat(&mut self, ctx: &mut NodeContext<'_, Message>, leader: NodeId, ballot: Ballot) {
        if ballot < self.acceptor.promised {
            return;
        }
        if self.is_leader {
            if leader == self.id || ballot <= self.ballot {
                return;
            }
            tracing::info!(node = %self.id, %leader, %ballot, "heard a higher-ballot leader");
            self.step_down(ctx);
        }
        self.leader = Some(leader);
        self.reset_election_timer(ctx);
        self.hand_off_pending(ctx);
    }

    // ------------------------------------------------------------------------
    // Acceptor
    // ------------------------------------------------------------------------

    fn on_prepare(
        &mut self,
        ctx: &mut NodeContext<'_, Message>,
        src: NodeId,
        instance: Instance,
        ballot: Ballot,
    ) {
        if ballot <= self.acceptor.promised {
            tracing::debug!(
                node = %self.id,
                %src,
                %ballot,
                promised = %self.acceptor.promised,
                "rejecting stale prepare"
            );
            let nack = PaxosMessage::Nack {
                ballot: self.acceptor.promised,
            };
            ctx.send(src, Message::Paxos(nack));
            return;
        }

        self.set_promised(ballot);
        if !self.is_leader {
            self.leader = Some(src);
            self.reset_election_timer(ctx);
        }
        let promise = PaxosMessage::Promise {
            acceptor: self.id,
            instance,
            ballot,
            accepted: self.acceptor.accepted.get(&instance).cloned(),
        };
        ctx.send(src, Message::Paxos(promise));
    }

    fn on_accept(
        &mut self,
        ctx: &mut NodeContext<'_, Message>,
        src: NodeId,
        instance: Instance,
        ballot: Ballot,
        value: Value,
    ) {
        if ballot < self.acceptor.promised {
            tracing::debug!(
                node = %self.id,
                %src,
                %ballot,
                promised = %self.acceptor.promised,
                "rejecting stale accept"
            );
            let nack = PaxosMessage::Nack {
                ballot: self.acceptor.promised,
            };
            ctx.send(src, Message::Paxos(nack));
            return;
        }

        if ballot > self.acceptor.promised {
            self.set_promised(ballot);
        }
        self.acceptor.accepted.insert(
            instance,
            Proposal {
                ballot,
                value: value.clone(),
            },
        );
        self.persist_acceptor();

        if !self.is_leader {
            self.leader = Some(src);
            self.reset_election_timer(ctx);
        }

        let learn = Message::Paxos(PaxosMessage::Learn {
            acceptor: self.id,
            instance,
            ballot,
            value,
        });
        ctx.broadcast(&self.cluster, &learn);
    }

    // ------------------------------------------------------------------------
    // Learner
    // ------------------------------------------------------------------------

    fn on_learn(
        &mut self,
        ctx: &mut NodeContext<'_, Message>,
        acceptor: NodeId,
        instance: Instance,
        ballot: Ballot,
        value: Value,
    ) {
        // Late reports for a decided instance carry nothing new.
        if self.decided.contains_key(&instance) {
            return;
        }
        let reporters = self
            .learned
            .entry((instance, ballot, value.clone()))
            .or_default();
        if !reporters.insert(acceptor) || reporters.len() != self.quorum {
            return;
        }
        self.decide(ctx, instance, value);
    }

    fn decide(&mut self, ctx: &mut NodeContext<'_, Message>, instance: Instance, value: Value) {
        if let Some(existing) = self.decided.get(&instance) {
            assert!(
                *existing == value,
                "node {}: conflicting decisions for instance {instance}: \
                 {existing:?} then {value:?}",
                self.id
            );
            return;
        }

        self.decided.insert(instance, value.clone());
        self.learned.retain(|(learned, _, _), _| *learned != instance);
        self.persist_decided();
        tracing::debug!(node = %self.id, instance, ?value, "decided");

        if let Value::Command(command) = &value {
            let first_decision = self.decided_commands.insert(command.key());
            if let Some(position) = self.pending.iter().position(|pending| pending == command) {
                self.pending.remove(position);
                if first_decision {
                    ctx.record_commit();
                    let reply = Reply {
                        request_id: command.request_id,
                        status: ReplyStatus::Committed,
                    };
                    ctx.send(command.client_id, Message::Reply(reply));
                }
            }
        }

        if self.round.is_some_and(|round| round.instance == instance) {
            self.round = None;
        }
        self.try_start_round(ctx);
    }
}

// ============================================================================
// Node
// ============================================================================

impl Node<Message> for PaxosNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn on_start(&mut self, ctx: &mut NodeContext<'_, Message>) {
        self.persist_acceptor();
        self.persist_decided();
        if self.initial_leader == Some(self.id) {
            self.become_leader(ctx);
        } else {
            self.leader = self.initial_leader;
        }
        self.reset_election_timer(ctx);
    }

    fn on_message(&mut self, ctx: &mut NodeContext<'_, Message>, src: NodeId, msg: Message) {
        match msg {
            Message::Request(request) => self.on_request(ctx, request),
            Message::Paxos(PaxosMessage::Prepare { instance, ballot }) => {
                self.on_prepare(ctx, src, instance, ballot);
            }
            Message::Paxos(PaxosMessage::Promise {
                acceptor,
                instance,
                ballot,
                accepted,
            }) => self.collect_promise(ctx, acceptor, instance, ballot, accepted),
            Message::Paxos(PaxosMessage::Accept {
                instance,
                ballot,
                value,
            }) => self.on_accept(ctx, src, instance, ballot, value),
            Message::Paxos(PaxosMessage::Learn {
                acceptor,
                instance,
                ballot,
                value,
            }) => self.on_learn(ctx, acceptor, instance, ballot, value),
            Message::Paxos(PaxosMessage::Heartbeat { leader, ballot }) => {
                self.on_heartbeat(ctx, leader, ballot);
            }
            Message::Paxos(PaxosMessage::Nack { ballot }) => self.on_nack(ctx, ballot),
            other @ (Message::Reply(_) | Message::PrimaryBackup(_)) => {
                tracing::trace!(node = %self.id, %src, msg = ?other, "ignoring unknown message");
                ctx.record_unknown_message();
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut NodeContext<'_, Message>, timer: TimerId) {
        if timer == ELECTION_TIMER {
            self.on_election_timeout(ctx);
        } else if timer == HEARTBEAT_TIMER {
            self.on_heartbeat_timer(ctx);
        } else {
            tracing::trace!(node = %self.id, %timer, "ignoring unknown timer");
        }
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

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dcsim_sim::{EventKind, SimConfig, SimNetwork, Simulation};
    use proptest::prelude::*;
    use test_case::test_case;

    fn ids(n: u64) -> Vec<NodeId> {
        (0..n).map(NodeId::new).collect()
    }

    fn cluster(n: u64, config: &PaxosConfig) -> Simulation<Message> {
        let mut sim = Simulation::new(SimConfig::default().with_seed(1), SimNetwork::reliable());
        let all = ids(n);
        for id in &all {
            let node = PaxosNode::new(*id, &all, config.clone()).unwrap();
            sim.register_node(Box::new(node)).unwrap();
        }
        sim
    }

    fn paxos(sim: &Simulation<Message>, id: u64) -> &PaxosNode {
        sim.node_as::<PaxosNode>(NodeId::new(id)).unwrap()
    }

    fn request(sim: &mut Simulation<Message>, at_ns: u64, target: u64, request_id: u64) {
        let request = Request {
            client_id: NodeId::new(100),
            request_id,
            data: format!("cmd-{request_id}"),
        };
        sim.schedule(
            at_ns,
            NodeId::new(target),
            EventKind::Message {
                src: NodeId::new(100),
                msg: Message::Request(request),
            },
        )
        .unwrap();
    }

    #[test]
    fn quorum_sizes() {
        for (n, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3)] {
            let node = PaxosNode::new(NodeId::new(0), &ids(n), PaxosConfig::default()).unwrap();
            assert_eq!(node.quorum_size(), quorum);
        }
    }

    #[test]
    fn rejects_foreign_initial_leader() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(9));
        assert!(PaxosNode::new(NodeId::new(0), &ids(3), config).is_err());
    }

    #[test_case("heartbeat_interval_ms", 0.0; "zero heartbeat")]
    #[test_case("election_timeout_ms", -5.0; "negative election timeout")]
    #[test_case("election_jitter_ms", f64::NAN; "nan jitter")]
    fn invalid_configs_are_rejected(field: &str, value: f64) {
        let mut config = PaxosConfig::default();
        match field {
            "heartbeat_interval_ms" => config.heartbeat_interval_ms = value,
            "election_timeout_ms" => config.election_timeout_ms = value,
            _ => config.election_jitter_ms = value,
        }
        assert!(matches!(config.validate(), Err(SimError::Configuration(_))));
    }

    #[test]
    fn single_node_cluster_decides_alone() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(0));
        let mut sim = cluster(1, &config);
        request(&mut sim, 0, 0, 1);
        sim.run_until(ms_to_ns(20.0));

        let node = paxos(&sim, 0);
        assert!(node.is_decided(NodeId::new(100), 1));
        assert_eq!(sim.counters(NodeId::new(0)).unwrap().commit_count, 1);
    }

    #[test]
    fn stream_of_commands_fills_consecutive_instances() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(2));
        let mut sim = cluster(3, &config);
        for request_id in 0..5 {
            request(&mut sim, request_id * 100_000, 2, request_id);
        }
        sim.run_until(ms_to_ns(40.0));

        for id in 0..3 {
            let decided = paxos(&sim, id).decided();
            assert_eq!(decided.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(sim.counters(NodeId::new(2)).unwrap().commit_count, 5);
        assert_eq!(paxos(&sim, 2).pending_len(), 0);
    }

    #[test]
    fn duplicate_request_is_not_committed_twice() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(2));
        let mut sim = cluster(3, &config);
        request(&mut sim, 0, 2, 7);
        request(&mut sim, ms_to_ns(20.0), 2, 7);
        sim.run_until(ms_to_ns(40.0));

        assert_eq!(paxos(&sim, 2).decided().len(), 1);
        assert_eq!(sim.counters(NodeId::new(2)).unwrap().commit_count, 1);
    }

    #[test]
    fn acceptor_state_is_written_through() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(2));
        let mut sim = cluster(3, &config);
        request(&mut sim, 0, 2, 1);
        sim.run_until(ms_to_ns(40.0));

        let node = paxos(&sim, 0);
        let stored: AcceptorState = node.store().get(ACCEPTOR_KEY).unwrap().unwrap();
        assert_eq!(stored.promised, node.promised_ballot());
        assert_eq!(stored.accepted.get(&0), node.accepted(0));
        let decided: BTreeMap<Instance, Value> = node.store().get(DECIDED_KEY).unwrap().unwrap();
        assert_eq!(&decided, node.decided());
    }

    #[test]
    fn stale_prepare_is_nacked() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(2));
        let mut sim = cluster(3, &config);
        request(&mut sim, 0, 2, 1);
        sim.run_until(ms_to_ns(40.0));

        let promised = paxos(&sim, 0).promised_ballot();
        let sent_before = sim.counters(NodeId::new(0)).unwrap().messages_sent;
        sim.with_node(NodeId::new(0), |node, ctx| {
            node.on_message(
                ctx,
                NodeId::new(1),
                Message::Paxos(PaxosMessage::Prepare {
                    instance: 1,
                    ballot: Ballot::new(1),
                }),
            );
        });

        assert_eq!(sim.counters(NodeId::new(0)).unwrap().messages_sent, sent_before + 1);
        assert_eq!(paxos(&sim, 0).promised_ballot(), promised);
        assert!(promised > Ballot::new(1));
    }

    #[test]
    fn foreign_messages_are_counted() {
        let mut sim = cluster(3, &PaxosConfig::default());
        sim.schedule(
            0,
            NodeId::new(1),
            EventKind::Message {
                src: NodeId::new(0),
                msg: Message::PrimaryBackup(crate::message::PrimaryBackupMessage::Heartbeat {
                    primary: NodeId::new(0),
                }),
            },
        )
        .unwrap();
        sim.run_until(1_000);
        assert_eq!(sim.counters(NodeId::new(1)).unwrap().messages_ignored, 1);
    }

    #[test]
    fn leaders_step_ballots_past_their_own_promise() {
        let mut sim = cluster(3, &PaxosConfig::default());
        sim.start();
        // Node 0 promises a high ballot, then wins leadership itself.
        sim.with_node(NodeId::new(0), |node, ctx| {
            node.on_message(
                ctx,
                NodeId::new(1),
                Message::Paxos(PaxosMessage::Prepare {
                    instance: 0,
                    ballot: Ballot::new(10),
                }),
            );
            let paxos = node.as_any_mut().downcast_mut::<PaxosNode>().unwrap();
            paxos.become_leader(ctx);
        });
        let node = paxos(&sim, 0);
        assert!(node.is_leader());
        assert!(node.ballot() > Ballot::new(10));
        assert_eq!(node.ballot().as_u64() % 3, 0);
    }

    fn command(request_id: u64) -> Command {
        Command {
            client_id: NodeId::new(100),
            request_id,
            data: format!("cmd-{request_id}"),
        }
    }

    fn as_paxos(node: &mut dyn Node<Message>) -> &mut PaxosNode {
        node.as_any_mut().downcast_mut::<PaxosNode>().unwrap()
    }

    #[test]
    fn new_leader_adopts_highest_ballot_accepted_value() {
        let mut sim = cluster(3, &PaxosConfig::default());
        sim.start();
        sim.remove_node(NodeId::new(1));

        // Node 0 accepted c2 at ballot 7; the would-be leader accepted c1 at 3.
        sim.with_node(NodeId::new(0), |node, _| {
            as_paxos(node).acceptor = AcceptorState {
                promised: Ballot::new(7),
                accepted: BTreeMap::from([(
                    0,
                    Proposal {
                        ballot: Ballot::new(7),
                        value: Value::Command(command(2)),
                    },
                )]),
            };
        });
        sim.with_node(NodeId::new(2), |node, ctx| {
            let paxos = as_paxos(node);
            paxos.acceptor = AcceptorState {
                promised: Ballot::new(7),
                accepted: BTreeMap::from([(
                    0,
                    Proposal {
                        ballot: Ballot::new(3),
                        value: Value::Command(command(1)),
                    },
                )]),
            };
            paxos.pending.push_back(command(3));
            paxos.become_leader(ctx);
        });
        let now = sim.now();
        sim.run_until(now + ms_to_ns(40.0));

        let leader = paxos(&sim, 2);
        let accepted = leader.accepted(0).unwrap();
        assert!(accepted.ballot > Ballot::new(7));
        assert_eq!(accepted.value, Value::Command(command(2)));
        for id in [0, 2] {
            let decided = paxos(&sim, id).decided();
            assert_eq!(decided.get(&0), Some(&Value::Command(command(2))));
            assert_eq!(decided.get(&1), Some(&Value::Command(command(3))));
        }
    }

    #[test_case(0, 100, false; "higher ballot from another node")]
    #[test_case(1, 4, true; "lower ballot from another node")]
    #[test_case(2, 100, true; "own heartbeat")]
    fn leader_heartbeat_handling(from: u64, ballot: u64, stays_leader: bool) {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(2));
        let mut sim = cluster(3, &config);
        sim.start();
        assert_eq!(paxos(&sim, 2).ballot(), Ballot::new(5));

        sim.with_node(NodeId::new(2), |node, ctx| {
            node.on_message(
                ctx,
                NodeId::new(from),
                Message::Paxos(PaxosMessage::Heartbeat {
                    leader: NodeId::new(from),
                    ballot: Ballot::new(ballot),
                }),
            );
        });

        let node = paxos(&sim, 2);
        assert_eq!(node.is_leader(), stays_leader);
        let expected = if stays_leader { 2 } else { from };
        assert_eq!(node.leader(), Some(NodeId::new(expected)));
    }

    #[test]
    fn nack_above_round_ballot_forces_step_down() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(2));
        let mut sim = cluster(3, &config);
        sim.remove_node(NodeId::new(0));
        sim.remove_node(NodeId::new(1));
        request(&mut sim, 0, 2, 1);
        sim.run_until(ms_to_ns(1.0));
        let round_ballot = paxos(&sim, 2).ballot();
        assert_eq!(round_ballot, Ballot::new(5));

        let nack = |ballot| Message::Paxos(PaxosMessage::Nack { ballot });
        sim.with_node(NodeId::new(2), |node, ctx| {
            node.on_message(ctx, NodeId::new(0), nack(Ballot::new(4)));
        });
        assert!(paxos(&sim, 2).is_leader());

        sim.with_node(NodeId::new(2), |node, ctx| {
            node.on_message(ctx, NodeId::new(0), nack(Ballot::new(9)));
        });
        let node = paxos(&sim, 2);
        assert!(!node.is_leader());
        assert_eq!(node.leader(), None);
        assert!(node.ballot() > Ballot::new(9));
        assert_eq!(node.ballot().as_u64() % 3, 2);
        // The undecided command stays with the deposed leader.
        assert_eq!(node.pending_len(), 1);
    }

    #[test]
    fn learner_reports_are_released_once_decided() {
        let config = PaxosConfig::default().with_initial_leader(NodeId::new(2));
        let mut sim = cluster(3, &config);
        for request_id in 0..3 {
            request(&mut sim, request_id * 100_000, 2, request_id);
        }
        sim.run_until(ms_to_ns(40.0));

        for id in 0..3 {
            let node = paxos(&sim, id);
            assert_eq!(node.decided().len(), 3);
            assert!(node.learned.is_empty(), "node {id} kept learner reports");
        }
    }

    #[test]
    fn follower_without_leader_drops_request() {
        let mut sim = cluster(3, &PaxosConfig::default());
        request(&mut sim, 0, 0, 1);
        sim.run_until(ms_to_ns(1.0));

        let node = paxos(&sim, 0);
        assert_eq!(node.leader(), None);
        assert_eq!(node.pending_len(), 0);
        assert_eq!(sim.counters(NodeId::new(0)).unwrap().messages_sent, 0);
    }

    proptest! {
        #[test]
        fn prop_ballots_from_distinct_nodes_never_collide(
            n in 1u64..12,
            a in 0u64..12,
            b in 0u64..12,
            rounds_a in 0u64..64,
            rounds_b in 0u64..64,
            floor in 0u64..500,
        ) {
            prop_assume!(a < n && b < n && a != b);
            let all = ids(n);
            let mut first = PaxosNode::new(NodeId::new(a), &all, PaxosConfig::default()).unwrap();
            let mut second = PaxosNode::new(NodeId::new(b), &all, PaxosConfig::default()).unwrap();

            let mut seen_a = BTreeSet::new();
            for _ in 0..rounds_a {
                first.ballot = first.ballot.advance(n);
                seen_a.insert(first.ballot);
            }
            first.advance_ballot_past(Ballot::new(floor));
            seen_a.insert(first.ballot);

            for _ in 0..rounds_b {
                second.ballot = second.ballot.advance(n);
                prop_assert!(!seen_a.contains(&second.ballot));
            }
            second.advance_ballot_past(Ballot::new(floor));
            prop_assert!(!seen_a.contains(&second.ballot));
        }
    }
}

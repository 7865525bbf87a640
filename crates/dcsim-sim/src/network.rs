//! Simulated network fault model.
//!
//! The network never carries payloads. For each send it decides the fate of
//! the message (rejected by a partition, lost, or delivered at some virtual
//! time) and the caller schedules the delivery event. Every outcome is a
//! [`SendResult`] plus a counter bump; nothing here returns an error once the
//! configuration has been validated.
//!
//! ```text
//!  send(src, dst)                         sync_send(src, dst, timeout)
//!    │ partition? ──► Rejected              │ partition? ──► Rejected
//!    │ loss?      ──► Dropped               │ violation? ──► sync_delay × U(5,10)
//!    │ travel = base ± jitter (≥ 0.1 ms)    │ otherwise  ──► sync_delay × U(0.9,1)
//!    ▼                                      ▼
//!  switch: deliver = max(arrival, link_free_at[dst]) + processing
//!    │ reorder? ──► hold U(0, base], link not occupied
//!    ▼
//!  Queued { deliver_at_ns }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::clock::ms_to_ns;
use crate::error::{Result, SimError};
use crate::rng::SimRng;
use crate::types::NodeId;

/// Smallest one-way travel time of an asynchronous message (0.1 ms).
pub const MIN_TRAVEL_NS: u64 = 100_000;

// ============================================================================
// Configuration
// ============================================================================

/// Network parameters, in milliseconds and probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Mean one-way latency of an asynchronous send.
    pub base_delay_ms: f64,
    /// Jitter as a fraction of `base_delay_ms` (uniform, symmetric).
    pub jitter_fraction: f64,
    /// Probability that an asynchronous send is lost.
    pub packet_loss_rate: f64,
    /// Probability that a message is held back so later sends overtake it.
    pub reorder_probability: f64,
    /// Nominal latency of the bounded-latency channel.
    pub sync_delay_ms: f64,
    /// Probability that a synchronous send violates its latency bound.
    pub p_sync_violate: f64,
    /// Time the destination's switch port is busy per message.
    pub switch_processing_ms: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1.0,
            jitter_fraction: 0.0,
            packet_loss_rate: 0.0,
            reorder_probability: 0.0,
            sync_delay_ms: 0.5,
            p_sync_violate: 0.01,
            switch_processing_ms: 0.05,
        }
    }
}

impl NetworkConfig {
    /// A network with no loss, no reordering and no synchrony violations.
    pub fn reliable() -> Self {
        Self {
            p_sync_violate: 0.0,
            ..Self::default()
        }
    }

    /// Sets the loss probability.
    pub fn with_packet_loss_rate(mut self, rate: f64) -> Self {
        self.packet_loss_rate = rate;
        self
    }

    /// Sets the reorder probability.
    pub fn with_reorder_probability(mut self, probability: f64) -> Self {
        self.reorder_probability = probability;
        self
    }

    /// Sets the base latency and jitter fraction.
    pub fn with_latency(mut self, base_delay_ms: f64, jitter_fraction: f64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.jitter_fraction = jitter_fraction;
        self
    }

    /// Sets the bounded-latency channel parameters.
    pub fn with_sync(mut self, sync_delay_ms: f64, p_sync_violate: f64) -> Self {
        self.sync_delay_ms = sync_delay_ms;
        self.p_sync_violate = p_sync_violate;
        self
    }

    /// Checks that probabilities lie in `[0, 1]` and delays are finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        let probabilities = [
            ("packet_loss_rate", self.packet_loss_rate),
            ("reorder_probability", self.reorder_probability),
            ("p_sync_violate", self.p_sync_violate),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(SimError::configuration(format!(
                    "{name} must be a probability in [0, 1], got {value}"
                )));
            }
        }

        let non_negative = [
            ("base_delay_ms", self.base_delay_ms),
            ("jitter_fraction", self.jitter_fraction),
            ("sync_delay_ms", self.sync_delay_ms),
            ("switch_processing_ms", self.switch_processing_ms),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SimError::configuration(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Fate of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Accepted; the message arrives at `deliver_at_ns`.
    Queued {
        deliver_at_ns: u64,
        /// The projected delivery overran the caller's synchronous timeout.
        timeout_exceeded: bool,
    },
    /// Lost to random packet loss.
    Dropped,
    /// Blocked before reaching the wire.
    Rejected { reason: RejectReason },
}

impl SendResult {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    /// Delivery time, if the message was queued.
    pub fn deliver_at(&self) -> Option<u64> {
        match self {
            Self::Queued { deliver_at_ns, .. } => Some(*deliver_at_ns),
            Self::Dropped | Self::Rejected { .. } => None,
        }
    }
}

/// Why a send was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Source and destination are in different partition groups.
    Partitioned,
}

/// Running totals over the lifetime of the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub messages_sent: u64,
    /// Lost to packet loss or blocked by a partition.
    pub messages_dropped: u64,
    pub messages_partitioned: u64,
    /// Scheduled for delivery.
    pub messages_delivered: u64,
    pub messages_reordered: u64,
    pub sync_violations: u64,
    pub sync_timeouts_exceeded: u64,
}

impl NetworkStats {
    /// Fraction of sent messages that were dropped; `0.0` before any send.
    pub fn loss_rate(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.messages_dropped as f64 / self.messages_sent as f64
        }
    }
}

// ============================================================================
// Partitions
// ============================================================================

/// A split of the cluster into groups that cannot reach each other.
///
/// Nodes listed in no group are reachable from everyone. If a node is listed
/// in several groups, the first one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    groups: Vec<BTreeSet<NodeId>>,
}

impl Partition {
    pub fn new(groups: Vec<BTreeSet<NodeId>>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[BTreeSet<NodeId>] {
        &self.groups
    }

    fn group_of(&self, node: NodeId) -> Option<usize> {
        self.groups.iter().position(|group| group.contains(&node))
    }

    /// Whether `a` and `b` sit in different groups.
    pub fn separates(&self, a: NodeId, b: NodeId) -> bool {
        match (self.group_of(a), self.group_of(b)) {
            (Some(group_a), Some(group_b)) => group_a != group_b,
            _ => false,
        }
    }
}

// ============================================================================
// Simulated Network
// ============================================================================

/// The network fault model.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    config: NetworkConfig,
    base_delay_ns: u64,
    sync_delay_ns: u64,
    switch_processing_ns: u64,
    /// Time at which each destination's switch port becomes free.
    link_free_at: BTreeMap<NodeId, u64>,
    partition: Option<Partition>,
    stats: NetworkStats,
}

impl SimNetwork {
    /// Validates `config` and builds a network with no active partition.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    /// A network built from [`NetworkConfig::reliable`].
    pub fn reliable() -> Self {
        Self::from_validated(NetworkConfig::reliable())
    }

    fn from_validated(config: NetworkConfig) -> Self {
        Self {
            base_delay_ns: ms_to_ns(config.base_delay_ms),
            sync_delay_ns: ms_to_ns(config.sync_delay_ms),
            switch_processing_ns: ms_to_ns(config.switch_processing_ms),
            config,
            link_free_at: BTreeMap::new(),
            partition: None,
            stats: NetworkStats::default(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Decides the fate of an asynchronous, best-effort send.
    pub fn send(&mut self, src: NodeId, dst: NodeId, now_ns: u64, rng: &mut SimRng) -> SendResult {
        self.stats.messages_sent += 1;

        if let Some(rejected) = self.check_partition(src, dst) {
            return rejected;
        }

        if rng.next_bool_with_probability(self.config.packet_loss_rate) {
            self.stats.messages_dropped += 1;
            tracing::trace!(%src, %dst, "message lost");
            return SendResult::Dropped;
        }

        let arrival_ns = now_ns.saturating_add(self.sample_travel_ns(rng));
        let mut deliver_at_ns = self.pass_switch(dst, arrival_ns);

        if self.config.reorder_probability > 0.0
            && rng.next_bool_with_probability(self.config.reorder_probability)
        {
            // The hold happens after the switch, so the port stays free for
            // messages sent later.
            let hold_ns = 1 + (rng.next_f64() * self.base_delay_ns as f64) as u64;
            deliver_at_ns = deliver_at_ns.saturating_add(hold_ns);
            self.stats.messages_reordered += 1;
            tracing::trace!(%src, %dst, hold_ns, "message held for reordering");
        }

        self.stats.messages_delivered += 1;
        SendResult::Queued {
            deliver_at_ns,
            timeout_exceeded: false,
        }
    }

    /// Decides the fate of a send over the bounded-latency channel.
    ///
    /// There is no random loss. The timeout is advisory: a delivery that
    /// overruns it still happens and is flagged in the result.
    pub fn sync_send(
        &mut self,
        src: NodeId,
        dst: NodeId,
        timeout_ns: Option<u64>,
        now_ns: u64,
        rng: &mut SimRng,
    ) -> SendResult {
        self.stats.messages_sent += 1;

        if let Some(rejected) = self.check_partition(src, dst) {
            return rejected;
        }

        let nominal = self.sync_delay_ns as f64;
        let delay_ns = if rng.next_bool_with_probability(self.config.p_sync_violate) {
            self.stats.sync_violations += 1;
            let delay = (nominal * rng.uniform(5.0, 10.0)) as u64;
            tracing::debug!(%src, %dst, delay_ns = delay, "synchrony bound violated");
            delay
        } else {
            (nominal * rng.uniform(0.9, 1.0)) as u64
        };

        let deliver_at_ns = self.pass_switch(dst, now_ns.saturating_add(delay_ns));

        let timeout_exceeded = match timeout_ns {
            Some(timeout) => deliver_at_ns - now_ns > timeout,
            None => false,
        };
        if timeout_exceeded {
            self.stats.sync_timeouts_exceeded += 1;
            tracing::debug!(%src, %dst, deliver_at_ns, "synchronous send overran its timeout");
        }

        self.stats.messages_delivered += 1;
        SendResult::Queued {
            deliver_at_ns,
            timeout_exceeded,
        }
    }

    /// Splits the cluster into two mutually unreachable groups.
    pub fn create_partition(
        &mut self,
        group_a: impl IntoIterator<Item = NodeId>,
        group_b: impl IntoIterator<Item = NodeId>,
    ) {
        self.partition(vec![
            group_a.into_iter().collect(),
            group_b.into_iter().collect(),
        ]);
    }

    /// Installs an arbitrary partition, replacing any active one.
    pub fn partition(&mut self, groups: Vec<BTreeSet<NodeId>>) {
        tracing::info!(?groups, "network partitioned");
        self.partition = Some(Partition::new(groups));
    }

    /// Removes the active partition. Returns whether one was active.
    pub fn heal_partition(&mut self) -> bool {
        let healed = self.partition.take().is_some();
        if healed {
            tracing::info!("network partition healed");
        }
        healed
    }

    pub fn active_partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    /// Whether the active partition separates `a` and `b`.
    pub fn is_partitioned(&self, a: NodeId, b: NodeId) -> bool {
        self.partition
            .as_ref()
            .is_some_and(|partition| partition.separates(a, b))
    }

    fn check_partition(&mut self, src: NodeId, dst: NodeId) -> Option<SendResult> {
        if !self.is_partitioned(src, dst) {
            return None;
        }
        self.stats.messages_dropped += 1;
        self.stats.messages_partitioned += 1;
        tracing::trace!(%src, %dst, "message blocked by partition");
        Some(SendResult::Rejected {
            reason: RejectReason::Partitioned,
        })
    }

    fn sample_travel_ns(&self, rng: &mut SimRng) -> u64 {
        let base = self.base_delay_ns as f64;
        let spread = base * self.config.jitter_fraction;
        let travel = if spread > 0.0 {
            base + rng.uniform(-spread, spread)
        } else {
            base
        };
        travel.max(MIN_TRAVEL_NS as f64) as u64
    }

    /// Serializes arrivals at the destination's switch port.
    fn pass_switch(&mut self, dst: NodeId, arrival_ns: u64) -> u64 {
        let free_at = self.link_free_at.get(&dst).copied().unwrap_or(0);
        let deliver_at_ns = arrival_ns.max(free_at).saturating_add(self.switch_processing_ns);
        self.link_free_at.insert(dst, deliver_at_ns);
        deliver_at_ns
    }
}

// ============================================================================
// Tests
// ============================================================================

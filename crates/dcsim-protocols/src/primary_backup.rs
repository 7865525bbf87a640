//! Primary-backup replication.
//!
//! The highest id starts as primary. Each client request is replicated to
//! every backup over the bounded-latency channel and commits only once all
//! N−1 backups acknowledged it (full replication, not a majority).
//!
//! Failover is deliberately narrow: when heartbeats stop, only the
//! statically second-highest id promotes itself. It still expects acks from
//! every other node, the dead primary included, so writes after failover do
//! not commit.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

use dcsim_sim::{
    Node, NodeContext, NodeId, NodeSpec, Result, SendResult, SimError, Store, TimerId, ms_to_ns,
};
use serde::{Deserialize, Serialize};

use crate::message::{Message, PrimaryBackupMessage, Reply, ReplyStatus, Request};

pub const ELECTION_TIMER: TimerId = TimerId::new("pb-election");
pub const HEARTBEAT_TIMER: TimerId = TimerId::new("pb-heartbeat");

/// Store key of the replicated data log.
pub const DATA_KEY: &str = "data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrimaryBackupConfig {
    pub heartbeat_interval_ms: f64,
    pub election_timeout_ms: f64,
    /// Advisory timeout passed to every replication `sync_send`.
    pub sync_timeout_ms: Option<f64>,
}

impl Default for PrimaryBackupConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50.0,
            election_timeout_ms: 150.0,
            sync_timeout_ms: None,
        }
    }
}

impl PrimaryBackupConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("heartbeat_interval_ms", Some(self.heartbeat_interval_ms)),
            ("election_timeout_ms", Some(self.election_timeout_ms)),
            ("sync_timeout_ms", self.sync_timeout_ms),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || value <= 0.0 {
                    return Err(SimError::Configuration(format!(
                        "{name} must be finite and positive, got {value}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Backup,
}

/// A write waiting for backup acknowledgements.
#[derive(Debug, Clone)]
struct PendingWrite {
    client_id: NodeId,
    data: String,
    acks: BTreeSet<NodeId>,
}

pub struct PrimaryBackupNode {
    id: NodeId,
    /// Every node except this one.
    others: Vec<NodeId>,
    /// Statically second-highest id; the only node allowed to take over.
    successor: Option<NodeId>,
    role: Role,
    primary: NodeId,
    heartbeat_interval_ns: u64,
    election_timeout_ns: u64,
    sync_timeout_ns: Option<u64>,
    store: Store,
    data: Vec<String>,
    pending: BTreeMap<(NodeId, u64), PendingWrite>,
    committed: BTreeSet<(NodeId, u64)>,
}

impl PrimaryBackupNode {
    pub fn new(id: NodeId, all_nodes: &[NodeId], config: PrimaryBackupConfig) -> Result<Self> {
        config.validate()?;

        let mut cluster = all_nodes.to_vec();
        cluster.sort_unstable();
        cluster.dedup();
        if !cluster.contains(&id) {
            return Err(SimError::Configuration(format!(
                "node {id} is not a member of the cluster"
            )));
        }
        let primary = cluster.last().copied().unwrap_or(id);
        let successor = cluster.iter().rev().nth(1).copied();
        let others = cluster.into_iter().filter(|node| *node != id).collect();

        Ok(Self {
            id,
            others,
            successor,
            role: Role::Backup,
            primary,
            heartbeat_interval_ns: ms_to_ns(config.heartbeat_interval_ms),
            election_timeout_ns: ms_to_ns(config.election_timeout_ms),
            sync_timeout_ns: config.sync_timeout_ms.map(ms_to_ns),
            store: Store::new(),
            data: Vec::new(),
            pending: BTreeMap::new(),
            committed: BTreeSet::new(),
        })
    }

    /// Registry constructor.
    pub fn from_spec(spec: NodeSpec<'_>) -> Result<Box<dyn Node<Message>>> {
        let config: PrimaryBackupConfig = spec.params()?;
        Ok(Box::new(Self::new(spec.node_id, spec.all_nodes, config)?))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The primary this node currently follows (itself when primary).
    pub fn primary(&self) -> NodeId {
        self.primary
    }

    /// The replicated data log.
    pub fn data(&self) -> &[String] {
        &self.data
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_committed(&self, client: NodeId, request_id: u64) -> bool {
        self.committed.contains(&(client, request_id))
    }

    fn persist_data(&mut self) {
        if let Err(error) = self.store.put(DATA_KEY, &self.data) {
            tracing::error!(node = %self.id, %error, "failed to persist data log");
        }
    }

    fn reset_election_timer(&self, ctx: &mut NodeContext<'_, Message>) {
        ctx.set_timer(self.election_timeout_ns, ELECTION_TIMER);
    }

    fn broadcast_heartbeat(&self, ctx: &mut NodeContext<'_, Message>) {
        let heartbeat =
            Message::PrimaryBackup(PrimaryBackupMessage::Heartbeat { primary: self.id });
        ctx.broadcast(&self.others, &heartbeat);
    }

    fn become_primary(&mut self, ctx: &mut NodeContext<'_, Message>) {
        tracing::info!(node = %self.id, previous = %self.primary, "became primary");
        self.role = Role::Primary;
        self.primary = self.id;
        self.pending.clear();
        ctx.cancel_timer(ELECTION_TIMER);
        self.broadcast_heartbeat(ctx);
        ctx.set_timer(self.heartbeat_interval_ns, HEARTBEAT_TIMER);
    }

    fn step_down(&mut self, ctx: &mut NodeContext<'_, Message>, primary: NodeId) {
        tracing::info!(node = %self.id, %primary, "stepping down");
        self.role = Role::Backup;
        self.pending.clear();
        ctx.cancel_timer(HEARTBEAT_TIMER);
    }

    fn on_request(&mut self, ctx: &mut NodeContext<'_, Message>, request: Request) {
        if self.role != Role::Primary {
            tracing::debug!(
                node = %self.id,
                primary = %self.primary,
                request = request.request_id,
                "forwarding request to primary"
            );
            ctx.send(self.primary, Message::Request(request));
            return;
        }

        let key = (request.client_id, request.request_id);
        if self.committed.contains(&key) || self.pending.contains_key(&key) {
            tracing::debug!(node = %self.id, client = %key.0, request = key.1, "duplicate request");
            return;
        }

        let write = PendingWrite {
            client_id: request.client_id,
            data: request.data,
            acks: BTreeSet::new(),
        };
        if self.others.is_empty() {
            self.commit(ctx, key, write);
            return;
        }

        let replicate = Message::PrimaryBackup(PrimaryBackupMessage::Replicate {
            client_id: write.client_id,
            request_id: key.1,
            data: write.data.clone(),
        });
        self.pending.insert(key, write);
        for backup in &self.others {
            let result = ctx.sync_send(*backup, replicate.clone(), self.sync_timeout_ns);
            if let SendResult::Queued {
                timeout_exceeded: true,
                deliver_at_ns,
            } = result
            {
                tracing::debug!(
                    node = %self.id,
                    %backup,
                    deliver_at_ns,
                    "replication overran its sync timeout"
                );
            }
        }
    }

    fn on_replicate(
        &mut self,
        ctx: &mut NodeContext<'_, Message>,
        src: NodeId,
        client_id: NodeId,
        request_id: u64,
        data: String,
    ) {
        self.data.push(data);
        self.persist_data();
        let ack = PrimaryBackupMessage::Ack {
            client_id,
            request_id,
        };
        ctx.send(src, Message::PrimaryBackup(ack));
        if self.role == Role::Backup {
            self.reset_election_timer(ctx);
        }
    }

    fn on_ack(
        &mut self,
        ctx: &mut NodeContext<'_, Message>,
        src: NodeId,
        client_id: NodeId,
        request_id: u64,
    ) {
        if self.role != Role::Primary {
            return;
        }
        let key = (client_id, request_id);
        let Some(write) = self.pending.get_mut(&key) else {
            return;
        };
        write.acks.insert(src);
        if write.acks.len() < self.others.len() {
            return;
        }
        if let Some(write) = self.pending.remove(&key) {
            self.commit(ctx, key, write);
        }
    }

    fn commit(
        &mut self,
        ctx: &mut NodeContext<'_, Message>,
        key: (NodeId, u64),
        write: PendingWrite,
    ) {
        self.data.push(write.data);
        self.persist_data();
        self.committed.insert(key);
        ctx.record_commit();
        tracing::debug!(node = %self.id, client = %key.0, request = key.1, "committed");

        let reply = Reply {
            request_id: key.1,
            status: ReplyStatus::Ok,
        };
        ctx.send(write.client_id, Message::Reply(reply));
    }

    fn on_heartbeat(&mut self, ctx: &mut NodeContext<'_, Message>, primary: NodeId) {
        if primary == self.id || primary < self.primary {
            return;
        }
        if self.role == Role::Primary {
            self.step_down(ctx, primary);
        }
        self.primary = primary;
        self.reset_election_timer(ctx);
    }

    fn on_election_timeout(&mut self, ctx: &mut NodeContext<'_, Message>) {
        if self.role == Role::Primary {
            return;
        }
        if self.successor == Some(self.id) {
            tracing::info!(node = %self.id, primary = %self.primary, "primary silent, taking over");
            self.become_primary(ctx);
        } else {
            self.reset_election_timer(ctx);
        }
    }
}

impl Node<Message> for PrimaryBackupNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn on_start(&mut self, ctx: &mut NodeContext<'_, Message>) {
        self.persist_data();
        if self.primary == self.id {
            self.become_primary(ctx);
        } else {
            self.reset_election_timer(ctx);
        }
    }

    fn on_message(&mut self, ctx: &mut NodeContext<'_, Message>, src: NodeId, msg: Message) {
        match msg {
            Message::Request(request) => self.on_request(ctx, request),
            Message::PrimaryBackup(PrimaryBackupMessage::Replicate {
                client_id,
                request_id,
                data,
            }) => self.on_replicate(ctx, src, client_id, request_id, data),
            Message::PrimaryBackup(PrimaryBackupMessage::Ack {
                client_id,
                request_id,
            }) => self.on_ack(ctx, src, client_id, request_id),
            Message::PrimaryBackup(PrimaryBackupMessage::Heartbeat { primary }) => {
                self.on_heartbeat(ctx, primary);
            }
            other @ (Message::Reply(_) | Message::Paxos(_)) => {
                tracing::trace!(node = %self.id, %src, msg = ?other, "ignoring unknown message");
                ctx.record_unknown_message();
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut NodeContext<'_, Message>, timer: TimerId) {
        if timer == ELECTION_TIMER {
            self.on_election_timeout(ctx);
        } else if timer == HEARTBEAT_TIMER && self.role == Role::Primary {
            self.broadcast_heartbeat(ctx);
            ctx.set_timer(self.heartbeat_interval_ns, HEARTBEAT_TIMER);
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

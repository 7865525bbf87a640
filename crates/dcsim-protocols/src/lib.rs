//! # dcsim-protocols: Replication Protocols for dcsim
//!
//! Protocol state machines written against the [`dcsim_sim::Node`] trait:
//!
//! - [`PaxosNode`]: multi-instance Paxos with heartbeat leadership
//! - [`PrimaryBackupNode`]: full-replication primary-backup
//! - [`ClientNode`]: scripted client that records reply latency
//!
//! [`default_registry`] maps `"paxos"` and `"primary_backup"` to their
//! constructors and [`build_simulation`] turns a
//! [`SimulatorConfig`](dcsim_sim::SimulatorConfig) into a ready cluster.
//!
//! ```ignore
//! let config = ConfigLoader::new().with_file("dcsim.toml").load()?;
//! let mut sim = build_simulation(&config, &default_registry())?;
//! sim.register_node(Box::new(ClientNode::new(client, NodeId::new(0), script)))?;
//! sim.run(Some(ms_to_ns(1_000.0)));
//! ```

pub mod client;
pub mod cluster;
pub mod message;
pub mod paxos;
pub mod primary_backup;

pub use client::{ClientNode, Completion, ScriptedRequest};
pub use cluster::{PAXOS, PRIMARY_BACKUP, build_simulation, default_registry};
pub use message::{
    Ballot, Command, Instance, Message, PaxosMessage, PrimaryBackupMessage, Proposal, Reply,
    ReplyStatus, Request, Value,
};
pub use paxos::{AcceptorState, PaxosConfig, PaxosNode};
pub use primary_backup::{PrimaryBackupConfig, PrimaryBackupNode, Role};

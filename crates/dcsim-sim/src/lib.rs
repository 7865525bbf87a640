//! # dcsim-sim: Deterministic Discrete-Event Simulation
//!
//! This crate provides the core of a simulator for studying consensus and
//! replication protocols under adversarial network conditions: virtual time,
//! a time-ordered event queue, a network fault model, and the node
//! abstraction protocol state machines are written against.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Simulation<M>                            │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────────┐    │
//! │  │ SimClock    │   │ EventQueue   │   │ SimRng              │    │
//! │  │ (virtual ns)│   │ (time, seq)  │   │ (ChaCha8, seeded)   │    │
//! │  └─────────────┘   └──────┬───────┘   └─────────────────────┘    │
//! │                           │ dispatch                              │
//! │  ┌────────────────────────▼────────────────────────────────────┐ │
//! │  │  Box<dyn Node<M>>  ◄── NodeContext ──►  SimNetwork          │ │
//! │  │  on_message / on_timer    send / sync_send / set_timer      │ │
//! │  └─────────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use dcsim_sim::{SimConfig, SimNetwork, Simulation};
//!
//! let mut sim = Simulation::new(SimConfig::default().with_seed(7), SimNetwork::reliable());
//! sim.register_node(Box::new(my_node))?;
//! let summary = sim.run(Some(1_000_000_000)); // one simulated second
//! ```
//!
//! ## Determinism
//!
//! A run is a pure function of its seed and the sequence of calls made on
//! the `Simulation`. All randomness comes from one `SimRng`, all maps are
//! ordered, and events at equal times dispatch in enqueue order.

#![cfg_attr(test, allow(clippy::float_cmp))]

pub mod clock;
pub mod config;
mod error;
pub mod event;
pub mod network;
pub mod node;
pub mod registry;
pub mod rng;
mod simulation;
mod types;

pub use clock::{NS_PER_MS, SimClock, ms_to_ns, ns_to_ms};
pub use config::{ConfigLoader, SimulatorConfig};
pub use error::{Result, SimError};
pub use event::{Event, EventKind, EventQueue};
pub use network::{
    MIN_TRAVEL_NS, NetworkConfig, NetworkStats, Partition, RejectReason, SendResult, SimNetwork,
};
pub use node::{Node, NodeContext, NodeCounters, Store};
pub use registry::{Constructor, NodeSpec, Overrides, Registry, parse_overrides};
pub use rng::SimRng;
pub use simulation::{
    DEFAULT_MAX_EVENTS, MetricsSnapshot, SimConfig, SimSummary, Simulation, TraceEntry, TraceKind,
};
pub use types::{EventId, NodeId, TimerId};

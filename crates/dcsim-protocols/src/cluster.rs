//! Cluster assembly from a [`SimulatorConfig`].

use dcsim_sim::{Registry, Result, SimNetwork, Simulation, SimulatorConfig};

use crate::message::Message;
use crate::paxos::PaxosNode;
use crate::primary_backup::PrimaryBackupNode;

/// Registry name of [`PaxosNode`].
pub const PAXOS: &str = "paxos";
/// Registry name of [`PrimaryBackupNode`].
pub const PRIMARY_BACKUP: &str = "primary_backup";

/// A registry holding every protocol shipped with this crate.
pub fn default_registry() -> Registry<Message> {
    Registry::new()
        .with(PAXOS, PaxosNode::from_spec)
        .with(PRIMARY_BACKUP, PrimaryBackupNode::from_spec)
}

/// Builds a simulation with `config.num_nodes` servers running
/// `config.algorithm`. Clients are the caller's to add.
pub fn build_simulation(
    config: &SimulatorConfig,
    registry: &Registry<Message>,
) -> Result<Simulation<Message>> {
    config.validate()?;
    let network = SimNetwork::new(config.network.clone())?;
    let mut sim = Simulation::new(config.sim_config(), network);

    let all_nodes = config.node_ids();
    for id in &all_nodes {
        let node = registry.create(&config.algorithm, *id, &all_nodes, &config.protocol)?;
        sim.register_node(node)?;
    }

    tracing::info!(
        algorithm = %config.algorithm,
        nodes = all_nodes.len(),
        seed = config.seed,
        "cluster built"
    );
    Ok(sim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcsim_sim::{NodeId, SimError};
    use serde_json::json;

    #[test]
    fn default_registry_lists_both_protocols() {
        let registry = default_registry();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![PAXOS, PRIMARY_BACKUP]);
    }

    #[test]
    fn builds_every_server() {
        let config = SimulatorConfig {
            num_nodes: 3,
            algorithm: PAXOS.to_string(),
            ..SimulatorConfig::default()
        };
        let sim = build_simulation(&config, &default_registry()).unwrap();
        assert_eq!(
            sim.node_ids().collect::<Vec<_>>(),
            vec![NodeId::new(0), NodeId::new(1), NodeId::new(2)]
        );
        assert!(sim.node_as::<PaxosNode>(NodeId::new(1)).is_some());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let config = SimulatorConfig {
            algorithm: "raft".to_string(),
            ..SimulatorConfig::default()
        };
        let err = build_simulation(&config, &default_registry()).err().unwrap();
        assert!(matches!(err, SimError::UnknownAlgorithm(ref name) if name == "raft"));
    }

    #[test]
    fn overrides_reach_the_protocol() {
        let mut config = SimulatorConfig {
            num_nodes: 3,
            algorithm: PAXOS.to_string(),
            ..SimulatorConfig::default()
        };
        config.protocol.insert("initial_leader".to_string(), json!(1));
        let mut sim = build_simulation(&config, &default_registry()).unwrap();
        sim.start();
        assert!(sim.node_as::<PaxosNode>(NodeId::new(1)).unwrap().is_leader());
        assert_eq!(
            sim.node_as::<PaxosNode>(NodeId::new(0)).unwrap().leader(),
            Some(NodeId::new(1))
        );
    }

    #[test]
    fn unknown_override_is_a_configuration_error() {
        let mut config = SimulatorConfig::default();
        config.protocol.insert("heartbeat_ms".to_string(), json!(10));
        let err = build_simulation(&config, &default_registry()).err().unwrap();
        assert!(matches!(err, SimError::Configuration(_)));
    }
}

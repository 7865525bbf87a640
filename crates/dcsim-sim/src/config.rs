//! Simulator configuration.
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file (optional)
//! 3. Environment variables (`DCSIM_*`, nested keys joined with `__`,
//!    e.g. `DCSIM_NETWORK__PACKET_LOSS_RATE=0.05`)
//!
//! ```toml
//! seed = 7
//! num_nodes = 5
//! algorithm = "paxos"
//!
//! [network]
//! base_delay_ms = 1.0
//! packet_loss_rate = 0.01
//!
//! [protocol]
//! election_timeout_ms = 250.0
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::network::NetworkConfig;
use crate::registry::Overrides;
use crate::simulation::{DEFAULT_MAX_EVENTS, SimConfig};
use crate::types::NodeId;

/// Everything needed to set up one simulated cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub seed: u64,
    /// Servers are numbered `0..num_nodes`.
    pub num_nodes: u64,
    /// Registry name of the protocol every server runs.
    pub algorithm: String,
    pub max_events: u64,
    pub network: NetworkConfig,
    /// Protocol parameter overrides, passed to the registry constructor.
    pub protocol: Overrides,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            num_nodes: 5,
            algorithm: "primary_backup".to_string(),
            max_events: DEFAULT_MAX_EVENTS,
            network: NetworkConfig::default(),
            protocol: Overrides::new(),
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(SimError::configuration("num_nodes must be at least 1"));
        }
        if self.algorithm.trim().is_empty() {
            return Err(SimError::configuration("algorithm must not be empty"));
        }
        if self.max_events == 0 {
            return Err(SimError::configuration("max_events must be at least 1"));
        }
        self.network.validate()
    }

    /// Server ids, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.num_nodes).map(NodeId::new).collect()
    }

    /// Scheduler settings derived from this configuration.
    pub fn sim_config(&self) -> SimConfig {
        SimConfig::default()
            .with_seed(self.seed)
            .with_max_events(self.max_events)
    }

    /// Parses and validates a TOML document layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration loader with builder pattern.
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    env_source: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: "DCSIM".to_string(),
            env_source: None,
        }
    }

    /// Reads this TOML file; it must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "DCSIM").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Reads variables from `vars` instead of the process environment.
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    /// Merges all sources, deserializes, and validates.
    pub fn load(self) -> Result<SimulatorConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&SimulatorConfig::default())?);

        if let Some(path) = &self.file {
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        let mut environment = config::Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        if let Some(vars) = self.env_source {
            environment = environment.source(Some(vars.into_iter().collect()));
        }
        builder = builder.add_source(environment);

        let config: SimulatorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        tracing::debug!(
            seed = config.seed,
            nodes = config.num_nodes,
            algorithm = %config.algorithm,
            "configuration loaded"
        );
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

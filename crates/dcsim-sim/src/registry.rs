//! Protocol registry: maps an algorithm name to a node constructor.
//!
//! The registry is an ordinary value handed to setup code, not a global, so
//! tests can build their own with extra or fake protocols.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::error::{Result, SimError};
use crate::node::Node;
use crate::types::NodeId;

/// Protocol parameter overrides, as a JSON object.
pub type Overrides = serde_json::Map<String, serde_json::Value>;

/// Everything a constructor receives.
#[derive(Debug, Clone, Copy)]
pub struct NodeSpec<'a> {
    pub node_id: NodeId,
    /// Every server in the cluster, including `node_id`.
    pub all_nodes: &'a [NodeId],
    pub overrides: &'a Overrides,
}

impl NodeSpec<'_> {
    /// Deserializes the overrides into a parameter struct whose serde
    /// defaults supply the protocol's default parameters.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        parse_overrides(self.overrides)
    }
}

/// Builds a configured node.
pub type Constructor<M> = Box<dyn Fn(NodeSpec<'_>) -> Result<Box<dyn Node<M>>>>;

/// Name → constructor table.
pub struct Registry<M> {
    constructors: BTreeMap<String, Constructor<M>>,
}

impl<M> Registry<M> {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registers `constructor` under `name`, replacing any earlier entry.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(NodeSpec<'_>) -> Result<Box<dyn Node<M>>> + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
        self
    }

    /// Builder form of [`Registry::register`].
    pub fn with<F>(mut self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(NodeSpec<'_>) -> Result<Box<dyn Node<M>>> + 'static,
    {
        self.register(name, constructor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Builds node `node_id` of protocol `name`.
    pub fn create(
        &self,
        name: &str,
        node_id: NodeId,
        all_nodes: &[NodeId],
        overrides: &Overrides,
    ) -> Result<Box<dyn Node<M>>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| SimError::UnknownAlgorithm(name.to_string()))?;
        if !all_nodes.contains(&node_id) {
            return Err(SimError::configuration(format!(
                "node {node_id} is not a member of the cluster"
            )));
        }
        constructor(NodeSpec {
            node_id,
            all_nodes,
            overrides,
        })
    }
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserializes `overrides` into `T`, reporting failures as configuration errors.
pub fn parse_overrides<T: DeserializeOwned>(overrides: &Overrides) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(overrides.clone()))
        .map_err(|e| SimError::configuration(format!("invalid protocol overrides: {e}")))
}

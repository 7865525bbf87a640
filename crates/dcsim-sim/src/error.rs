//! Error types for the simulation core.
//!
//! Only setup problems are errors. Network outcomes (drops, partitions,
//! late synchronous deliveries) are ordinary return values, and messages a
//! node does not understand are counted, not raised.

use thiserror::Error;

/// Simulation setup errors.
#[derive(Error, Debug)]
pub enum SimError {
    /// Invalid parameter, malformed override, or an event scheduled in the past.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration sources (files, environment) could not be merged.
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// No constructor is registered under the requested protocol name.
    #[error("Unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    /// A node store entry could not be encoded or decoded.
    #[error("Store entry {key:?} is not valid: {source}")]
    Store {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SimError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type for simulation setup.
pub type Result<T> = std::result::Result<T, SimError>;

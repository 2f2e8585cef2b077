//! Stage process configuration.
//!
//! Every pipeline binary loads a [StageSettings] at startup from an optional
//! YAML file plus `CONTRAIL_`-prefixed environment variable overrides, with
//! nested keys separated by double underscores (`CONTRAIL_BROKER__ADDRESS`).
//! Values are validated before any broker connection is attempted;
//! out-of-range tunables clamp to their defaults with a logged warning.
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Prefix for environment variable overrides
const ENV_PREFIX: &str = "CONTRAIL";
/// Separator for nested keys in environment variables
const ENV_SEPARATOR: &str = "__";

/// Largest accepted rows-per-envelope batch
const MAX_BATCH_LINES: u32 = 1500;
/// Batch size used when none or an invalid one is configured
const DEFAULT_BATCH_LINES: u32 = 300;
/// Largest accepted per-stage replica count
const MAX_REPLICAS: u32 = 30;
/// Replica count used when none or an invalid one is configured
const DEFAULT_REPLICAS: u32 = 6;

/// Error loading or validating stage configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting has no value
    #[error("missing required setting '{0}'")]
    Missing(&'static str),
    /// The underlying sources could not be read or deserialized
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Validated settings of one pipeline stage process
#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    /// Unique identifier of this process within the deployment
    pub id: String,
    /// Address of the message broker
    pub broker_address: String,
    /// Partitioned queue this stage consumes from
    pub input_queue: String,
    /// Queues or exchanges this stage produces to
    #[serde(default)]
    pub output_queues: Vec<String>,
    /// Rows batched into one envelope by ingesting stages
    #[serde(default = "default_batch_lines")]
    pub batch_lines: u32,
    /// How many instances of this stage run inside the process
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Addresses of the health checkers to report liveness to
    #[serde(default)]
    pub health_checkers: Vec<String>,
}

fn default_batch_lines() -> u32 {
    DEFAULT_BATCH_LINES
}

fn default_replicas() -> u32 {
    DEFAULT_REPLICAS
}

/// Load settings from an optional YAML file and the environment
pub fn load(file: Option<&Path>) -> Result<StageSettings, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(file) = file {
        builder = builder.add_source(config::File::from(file));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator(ENV_SEPARATOR),
    );
    let settings: StageSettings = builder.build()?.try_deserialize()?;
    settings.validate()
}

impl StageSettings {
    /// Check required values and clamp tunables into their accepted ranges
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::Missing("id"));
        }
        if self.broker_address.is_empty() {
            return Err(ConfigError::Missing("broker_address"));
        }
        if self.input_queue.is_empty() {
            return Err(ConfigError::Missing("input_queue"));
        }
        if self.batch_lines == 0 || self.batch_lines > MAX_BATCH_LINES {
            warn!(
                batch_lines = self.batch_lines,
                default = DEFAULT_BATCH_LINES,
                "invalid batch lines, using default"
            );
            self.batch_lines = DEFAULT_BATCH_LINES;
        }
        if self.replicas == 0 || self.replicas > MAX_REPLICAS {
            warn!(
                replicas = self.replicas,
                default = DEFAULT_REPLICAS,
                "invalid replica count, using default"
            );
            self.replicas = DEFAULT_REPLICAS;
        }
        info!(
            id = %self.id,
            broker = %self.broker_address,
            input_queue = %self.input_queue,
            replicas = self.replicas,
            batch_lines = self.batch_lines,
            "configuration loaded"
        );
        Ok(self)
    }
}

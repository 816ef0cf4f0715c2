use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{DestinationConfig, PipelineConfig, SourceConfig, ValidationError};

/// Configuration for the replicator service.
///
/// Aggregates everything required to run the replicator. It is typically deserialized with
/// [`crate::load_config`] and handed, fully resolved, to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplicatorConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Lowers the default log level to `debug`.
    #[serde(default)]
    pub verbose: bool,
}

impl ReplicatorConfig {
    /// Returns the number of batches the feed may prefetch.
    pub fn buffer_size(&self) -> usize {
        self.pipeline
            .batch
            .buffer_size
            .unwrap_or_else(|| self.destination.default_buffer_size())
    }

    /// Validates the loaded [`ReplicatorConfig`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.destination.validate()?;
        self.pipeline.validate()?;

        Ok(())
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

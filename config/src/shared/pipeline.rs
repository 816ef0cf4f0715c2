use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::shared::{BatchConfig, ValidationError};

/// Configuration of a replication pipeline, independent of source and destination.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Drops existing checkpoints and target tables before replicating from scratch.
    #[serde(default)]
    pub reset: bool,
    /// Name of the document field whose value routes documents to per-type targets.
    #[serde(default)]
    pub split: Option<String>,
    /// Path of a JSON file describing a transform applied to every document.
    #[serde(default)]
    pub transform: Option<PathBuf>,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(split) = &self.split
            && split.is_empty()
        {
            return Err(ValidationError::InvalidPipeline(
                "split field name cannot be empty".to_string(),
            ));
        }

        self.batch.validate()
    }
}

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Default number of changes requested from the source per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 100;

/// Batch processing configuration for pipelines.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of change events requested from the source per batch.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Number of batches the feed may fetch ahead of processing.
    ///
    /// `0` makes the feed wait for every batch to be applied before fetching the next one. When
    /// unset, the destination picks its own default.
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

fn default_max_size() -> usize {
    DEFAULT_BATCH_MAX_SIZE
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_BATCH_MAX_SIZE,
            buffer_size: None,
        }
    }
}

impl BatchConfig {
    /// Validates the batch configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_size == 0 {
            return Err(ValidationError::InvalidPipeline(
                "Batch max_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

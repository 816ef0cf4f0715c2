//! Shared setup for the pipeline integration tests.

use config::shared::{BatchConfig, PipelineConfig, SourceConfig};
use couchwarehouse::destination::Destination;
use couchwarehouse::pipeline::{Pipeline, PipelinePhase};
use couchwarehouse::test_utils::source::MemorySource;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::timeout;

/// Database replicated by every test, whose sanitized name is `sampledata`.
pub const DATABASE: &str = "sample-data";

/// Name the targets of [`DATABASE`] are prefixed with.
pub const TARGET: &str = "sampledata";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn source_config() -> SourceConfig {
    let mut config = SourceConfig::new(DATABASE);
    config.sample_size = 10;
    config.longpoll_timeout_ms = 50;

    config
}

pub fn pipeline_config(split: Option<&str>) -> PipelineConfig {
    PipelineConfig {
        reset: false,
        split: split.map(str::to_string),
        transform: None,
        batch: BatchConfig {
            max_size: 25,
            buffer_size: Some(0),
        },
    }
}

pub fn create_pipeline<D>(
    source: &MemorySource,
    config: PipelineConfig,
    destination: D,
) -> Pipeline<MemorySource, D>
where
    D: Destination + Clone + Send + Sync + 'static,
{
    Pipeline::new(source_config(), config, source.clone(), destination)
}

/// Waits until `phase` is reached, failing the test if it takes too long.
pub async fn wait_for_phase(rx: &mut watch::Receiver<PipelinePhase>, phase: PipelinePhase) {
    timeout(WAIT_TIMEOUT, rx.wait_for(|current| *current == phase))
        .await
        .expect("timed out waiting for pipeline phase")
        .expect("pipeline phase channel closed");
}

pub async fn wait_for(notify: &Notify) {
    timeout(WAIT_TIMEOUT, notify.notified())
        .await
        .expect("timed out waiting for notification");
}

use couchwarehouse::checkpoint::base::CheckpointStore;
use couchwarehouse::destination::memory::MemoryDestination;
use couchwarehouse::error::ErrorKind;
use couchwarehouse::etl_error;
use couchwarehouse::pipeline::PipelinePhase;
use couchwarehouse::replication::processor::{BatchProcessor, ProcessorOptions};
use couchwarehouse::test_utils::fixtures::{
    ORDER_COUNT, PRODUCT_COUNT, SPLIT_FIELD, USER_COUNT, mixed_documents, person,
};
use couchwarehouse::test_utils::source::MemorySource;
use couchwarehouse::test_utils::test_destination_wrapper::TestDestinationWrapper;
use couchwarehouse::types::{ChangeEvent, Document, SequenceToken};
use serde_json::json;
use std::sync::Arc;
use telemetry::init_test_tracing;

use crate::common::{TARGET, create_pipeline, pipeline_config, wait_for, wait_for_phase};

#[tokio::test(flavor = "multi_thread")]
async fn split_mode_routes_every_type_to_its_own_target() {
    init_test_tracing();
    let source = MemorySource::new();
    let last = source.put_all(mixed_documents());

    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());
    let checkpointed = destination.wait_for_checkpoint(last).await;

    let config = pipeline_config(Some(SPLIT_FIELD));
    let mut pipeline = create_pipeline(&source, config, destination.clone());
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let memory = destination.wrapped();
    assert_eq!(
        memory.targets().await,
        vec!["sampledata_order", "sampledata_product", "sampledata_user"]
    );
    assert_eq!(memory.row_count("sampledata_product").await, PRODUCT_COUNT);
    assert_eq!(memory.row_count("sampledata_order").await, ORDER_COUNT);
    assert_eq!(memory.row_count("sampledata_user").await, USER_COUNT);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_resumes_from_the_checkpoint() {
    init_test_tracing();
    let source = MemorySource::new();
    let last = source.put_all((0..30).map(|i| person(&format!("person{i:02}"))));
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let checkpointed = destination.wait_for_checkpoint(last.clone()).await;
    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let requests_before_restart = source.requests().len();
    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    let mut phase_rx = pipeline.subscribe_phase();
    pipeline.start().await.unwrap();
    wait_for_phase(&mut phase_rx, PipelinePhase::Tailing).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let requests = source.requests();
    assert_eq!(requests[requests_before_restart].since, last);
    assert_eq!(destination.wrapped().row_count(TARGET).await, 30);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_replays_the_stream_from_the_start() {
    init_test_tracing();
    let source = MemorySource::new();
    let last = source.put_all((0..5).map(|i| person(&format!("person{i}"))));
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let checkpointed = destination.wait_for_checkpoint(last.clone()).await;
    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let requests_before_reset = source.requests().len();
    let mut config = pipeline_config(None);
    config.reset = true;
    let mut pipeline = create_pipeline(&source, config, destination.clone());
    let mut phase_rx = pipeline.subscribe_phase();
    pipeline.start().await.unwrap();
    wait_for_phase(&mut phase_rx, PipelinePhase::Tailing).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let requests = source.requests();
    assert_eq!(requests[requests_before_reset].since, SequenceToken::start());
    let ddl = destination.wrapped().executed_ddl().await;
    assert_eq!(ddl, vec!["CREATE sampledata", "DROP sampledata", "CREATE sampledata"]);
    assert_eq!(destination.wrapped().row_count(TARGET).await, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletions_remove_rows_and_never_insert_them() {
    init_test_tracing();
    let source = MemorySource::new();
    source.put(json!({"_id": "a", "name": "Jina", "age": 53}));
    source.put(json!({"_id": "b", "name": "Ola", "age": 31}));
    source.delete("a");
    let last = source.delete("never-written");

    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());
    let checkpointed = destination.wait_for_checkpoint(last).await;
    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let ids: Vec<_> = destination
        .wrapped()
        .rows(TARGET)
        .await
        .iter()
        .map(|row| row.id().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["b"]);

    let deletions_upserted = destination
        .applied_batches()
        .await
        .iter()
        .flat_map(|batch| batch.changes.iter())
        .any(|change| change.id() == "never-written" && !change.is_delete());
    assert!(!deletions_upserted);
}

#[tokio::test(flavor = "multi_thread")]
async fn design_documents_never_reach_targets_or_schemas() {
    init_test_tracing();
    let source = MemorySource::new();
    source.put(json!({
        "_id": "_design/app",
        "language": "javascript",
        "views": {"by_name": {"map": "function (doc) { emit(doc.name) }"}}
    }));
    source.put(json!({"_id": "p1", "name": "Jina"}));
    let last = source.put(json!({"_id": "_design/other", "views": {}}));

    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());
    let checkpointed = destination.wait_for_checkpoint(last).await;
    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let rows = destination.wrapped().rows(TARGET).await;
    assert_eq!(rows.len(), 1);
    let columns: Vec<_> = rows[0].columns().collect();
    assert_eq!(columns, vec!["name", "id"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_while_tailing_finishes_cleanly() {
    init_test_tracing();
    let source = MemorySource::new();
    source.put(person("p1"));
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    let mut phase_rx = pipeline.subscribe_phase();
    pipeline.start().await.unwrap();
    wait_for_phase(&mut phase_rx, PipelinePhase::Tailing).await;

    let two_rows = destination.wait_for_row_changes(2).await;
    let last = source.put(person("p2"));
    let checkpointed = destination.wait_for_checkpoint(last).await;
    wait_for(&two_rows).await;
    wait_for(&checkpointed).await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(*phase_rx.borrow(), PipelinePhase::Stopped);
    assert!(phase_rx.borrow().is_terminal());
    assert_eq!(destination.wrapped().row_count(TARGET).await, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_sample_documents_fail_discovery() {
    init_test_tracing();
    let source = MemorySource::new();
    source.put(json!({"_id": "_design/app", "views": {}}));
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    let mut phase_rx = pipeline.subscribe_phase();
    pipeline.start().await.unwrap();
    wait_for_phase(&mut phase_rx, PipelinePhase::Errored).await;

    // Stopping a finished pipeline leaves its outcome untouched.
    pipeline.stop();
    assert_eq!(pipeline.phase(), PipelinePhase::Errored);

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaDiscoveryFailed);
    assert_eq!(destination.apply_calls().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_apply_halts_without_checkpoint() {
    init_test_tracing();
    let source = MemorySource::new();
    source.put_all((0..3).map(|i| person(&format!("person{i}"))));
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());
    destination
        .fail_next_apply(etl_error!(ErrorKind::DestinationQueryFailed, "Commit failed"))
        .await;

    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    pipeline.start().await.unwrap();
    let err = pipeline.wait().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationQueryFailed);
    assert!(destination.written_checkpoints().await.is_empty());
    assert_eq!(destination.read_checkpoint(TARGET).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn feed_errors_are_fatal() {
    init_test_tracing();
    let source = MemorySource::new();
    source.put(person("p1"));
    source.fail_next_fetch(etl_error!(
        ErrorKind::SourceConnectionFailed,
        "Connection refused"
    ));
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone());
    pipeline.start().await.unwrap();
    let err = pipeline.wait().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
    assert_eq!(destination.wrapped().row_count(TARGET).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn transforms_shape_rows_before_inference() {
    init_test_tracing();
    let source = MemorySource::new();
    let last = source.put(person("p1"));
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let checkpointed = destination.wait_for_checkpoint(last).await;
    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination.clone())
        .with_transform(Arc::new(|mut document: Document| {
            document.remove("address");
            document.remove("tags");
            document
        }));
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    let rows = destination.wrapped().rows(TARGET).await;
    let columns: Vec<_> = rows[0].columns().collect();
    assert_eq!(columns, vec!["name", "age", "verified", "id", "rev"]);
}

#[tokio::test]
async fn reapplying_an_identical_batch_keeps_row_counts() {
    let destination = MemoryDestination::new();
    let mut processor = BatchProcessor::new(
        destination.clone(),
        ProcessorOptions {
            database: "sample-data".to_string(),
            split: None,
            reset: false,
        },
    );
    let batch: Vec<ChangeEvent> = (0..10)
        .map(|i| {
            let document = person(&format!("person{i}")).as_object().cloned().unwrap();
            ChangeEvent {
                sequence: SequenceToken::new(format!("{}-x", i + 1)),
                id: format!("person{i}"),
                document: Some(document),
                deleted: false,
            }
        })
        .collect();

    processor.process(batch.clone()).await.unwrap();
    processor.process(batch).await.unwrap();

    assert_eq!(destination.row_count(TARGET).await, 10);
    assert_eq!(processor.stats().applied, 20);
}

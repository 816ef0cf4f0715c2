use couchwarehouse::checkpoint::base::CheckpointStore;
use couchwarehouse::destination::sqlite::SqliteDestination;
use couchwarehouse::test_utils::fixtures::{
    ORDER_COUNT, PRODUCT_COUNT, SPLIT_FIELD, USER_COUNT, mixed_documents, person,
};
use couchwarehouse::test_utils::source::MemorySource;
use couchwarehouse::test_utils::test_destination_wrapper::TestDestinationWrapper;
use serde_json::json;
use telemetry::init_test_tracing;

use crate::common::{TARGET, create_pipeline, pipeline_config, wait_for};

async fn count(destination: &SqliteDestination, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(destination.pool())
        .await
        .unwrap()
}

async fn column_names(destination: &SqliteDestination, table: &str) -> Vec<String> {
    sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{table}') ORDER BY cid"))
        .fetch_all(destination.pool())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn split_stream_fills_one_table_per_type() {
    init_test_tracing();
    let source = MemorySource::new();
    let last = source.put_all(mixed_documents());

    let sqlite = SqliteDestination::in_memory().await.unwrap();
    let destination = TestDestinationWrapper::wrap(sqlite.clone());
    let checkpointed = destination.wait_for_checkpoint(last.clone()).await;

    let mut config = pipeline_config(Some(SPLIT_FIELD));
    config.batch.buffer_size = Some(16);
    let mut pipeline = create_pipeline(&source, config, destination);
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(count(&sqlite, "sampledata_product").await, PRODUCT_COUNT as i64);
    assert_eq!(count(&sqlite, "sampledata_order").await, ORDER_COUNT as i64);
    assert_eq!(count(&sqlite, "sampledata_user").await, USER_COUNT as i64);
    assert_eq!(sqlite.read_checkpoint(TARGET).await.unwrap(), Some(last));

    let verified: i64 =
        sqlx::query_scalar("SELECT verified FROM sampledata_user WHERE id = 'user02'")
            .fetch_one(sqlite.pool())
            .await
            .unwrap();
    assert_eq!(verified, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn table_columns_follow_the_first_document() {
    init_test_tracing();
    let source = MemorySource::new();
    source.put(person("p1"));
    let last = source.put(json!({"_id": "p2", "name": "Ola", "nickname": "o"}));

    let sqlite = SqliteDestination::in_memory().await.unwrap();
    let destination = TestDestinationWrapper::wrap(sqlite.clone());
    let checkpointed = destination.wait_for_checkpoint(last).await;

    let mut pipeline = create_pipeline(&source, pipeline_config(None), destination);
    pipeline.start().await.unwrap();
    wait_for(&checkpointed).await;
    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(
        column_names(&sqlite, TARGET).await,
        vec![
            "id",
            "name",
            "age",
            "verified",
            "address_street",
            "address_location_long",
            "address_location_lat",
            "tags",
            "rev",
        ]
    );

    let age: Option<f64> = sqlx::query_scalar("SELECT age FROM sampledata WHERE id = 'p2'")
        .fetch_one(sqlite.pool())
        .await
        .unwrap();
    assert_eq!(age, None);
}

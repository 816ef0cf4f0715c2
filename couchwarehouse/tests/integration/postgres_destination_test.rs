//! Runs against a live Postgres when `TESTS_POSTGRES_URL` is set and is skipped otherwise.

use couchwarehouse::checkpoint::base::CheckpointStore;
use couchwarehouse::conversions::flatten::flatten;
use couchwarehouse::destination::postgres::PostgresDestination;
use couchwarehouse::destination::{Destination, RowChange, TargetBatch};
use couchwarehouse::replication::processor::{BatchProcessor, ProcessorOptions};
use couchwarehouse::schema::{DocumentType, Schema, discover};
use couchwarehouse::test_utils::fixtures::person;
use couchwarehouse::types::{ChangeEvent, SequenceToken};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use telemetry::init_test_tracing;

/// Environment variable holding the connection url of the test Postgres.
const POSTGRES_URL_ENV_NAME: &str = "TESTS_POSTGRES_URL";

async fn postgres_destination() -> Option<PostgresDestination> {
    let Ok(url) = std::env::var(POSTGRES_URL_ENV_NAME) else {
        eprintln!("{POSTGRES_URL_ENV_NAME} is not set, skipping");
        return None;
    };

    let pool = PgPool::connect(&url)
        .await
        .expect("failed to connect to the test Postgres");
    let destination = PostgresDestination::from_pool(pool);
    destination.initialize(false).await.unwrap();

    Some(destination)
}

/// Returns a table name no other test run uses.
fn unique_table(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    format!("{prefix}_{nanos}")
}

async fn count(destination: &PostgresDestination, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(destination.pool())
        .await
        .unwrap()
}

async fn drop_table(destination: &PostgresDestination, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(destination.pool())
        .await
        .unwrap();
}

fn upsert(id: &str) -> RowChange {
    let document = person(id).as_object().cloned().unwrap();
    RowChange::Upsert {
        id: id.to_string(),
        row: flatten(&document),
        document,
    }
}

fn batch(target: &str, schema: &Arc<Schema>, changes: Vec<RowChange>) -> TargetBatch {
    TargetBatch {
        target: target.to_string(),
        document_type: DocumentType::Default,
        schema: schema.clone(),
        changes,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reapplying_batches_keeps_one_row_per_document() {
    init_test_tracing();
    let Some(destination) = postgres_destination().await else {
        return;
    };
    let database = unique_table("pgreplay");

    let mut processor = BatchProcessor::new(
        destination.clone(),
        ProcessorOptions {
            database: database.clone(),
            split: None,
            reset: false,
        },
    );
    let events: Vec<ChangeEvent> = (0..10)
        .map(|i| ChangeEvent {
            sequence: SequenceToken::new(format!("{}-pg", i + 1)),
            id: format!("person{i}"),
            document: person(&format!("person{i}")).as_object().cloned(),
            deleted: false,
        })
        .collect();

    let first = processor.process(events.clone()).await.unwrap();
    let second = processor.process(events).await.unwrap();

    assert_eq!(first.applied, 10);
    assert_eq!(second.applied, 10);
    assert_eq!(second.failed, 0);
    assert_eq!(count(&destination, &database).await, 10);
    assert_eq!(
        destination.read_checkpoint(&database).await.unwrap(),
        Some(SequenceToken::from("10-pg"))
    );

    drop_table(&destination, &database).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_rows_do_not_abort_the_transaction() {
    init_test_tracing();
    let Some(destination) = postgres_destination().await else {
        return;
    };
    let table = unique_table("pgisolation");
    let missing = unique_table("pgmissing");

    let document = person("p1").as_object().cloned().unwrap();
    let schema = Arc::new(discover(&flatten(&document)));
    let ddl = destination.generate_ddl(&table, &schema, false);

    let report = destination
        .apply_batch(
            ddl,
            vec![
                batch(&table, &schema, vec![upsert("p1")]),
                batch(&missing, &schema, vec![upsert("p2")]),
                batch(
                    &table,
                    &schema,
                    vec![
                        upsert("p3"),
                        RowChange::Delete {
                            id: "p1".to_string(),
                        },
                    ],
                ),
            ],
        )
        .await
        .unwrap();

    assert_eq!(report.applied, 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].target, missing);
    assert_eq!(report.failed[0].id, "p2");

    let ids: Vec<String> = sqlx::query_scalar(&format!("SELECT id FROM {table} ORDER BY id"))
        .fetch_all(destination.pool())
        .await
        .unwrap();
    assert_eq!(ids, vec!["p3"]);

    drop_table(&destination, &table).await;
}

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, error, info};

use crate::checkpoint::base::CheckpointStore;
use crate::destination::base::{ApplyReport, Destination, RowChange, TargetBatch};
use crate::destination::sql::{Dialect, upsert_query};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::schema::Schema;
use crate::types::SequenceToken;

const DIALECT: Dialect = Dialect::Sqlite;

/// Destination writing into an embedded SQLite database.
///
/// Rows are written with `REPLACE INTO`, booleans are stored as `0`/`1` integers.
#[derive(Debug, Clone)]
pub struct SqliteDestination {
    pool: SqlitePool,
}

impl SqliteDestination {
    /// Opens the database file at `path`, creating it if needed.
    pub async fn connect(path: &str) -> EtlResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        Self::connect_with(options).await
    }

    /// Opens a private in-memory database that lives as long as the destination.
    pub async fn in_memory() -> EtlResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> EtlResult<Self> {
        // A single connection keeps writes serialized and in-memory databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Failed to open SQLite database",
                    err
                )
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl CheckpointStore for SqliteDestination {
    async fn write_checkpoint(&self, key: &str, token: &SequenceToken) -> EtlResult<()> {
        sqlx::query(&DIALECT.insert_checkpoint())
            .bind(key)
            .bind(token.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn read_checkpoint(&self, key: &str) -> EtlResult<Option<SequenceToken>> {
        let seq: Option<String> = sqlx::query_scalar(&DIALECT.select_checkpoint())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(seq.map(SequenceToken::from))
    }
}

impl Destination for SqliteDestination {
    fn name() -> &'static str {
        "sqlite"
    }

    async fn initialize(&self, reset: bool) -> EtlResult<()> {
        if reset {
            info!("dropping sqlite checkpoints");
            sqlx::query(&DIALECT.drop_checkpoint_table())
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(&DIALECT.create_checkpoint_table())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn generate_ddl(&self, target: &str, schema: &Schema, reset: bool) -> Vec<String> {
        DIALECT.generate_ddl(target, schema, reset)
    }

    async fn apply_batch(
        &self,
        ddl: Vec<String>,
        batches: Vec<TargetBatch>,
    ) -> EtlResult<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut tx = self.pool.begin().await.map_err(|err| {
            etl_error!(
                ErrorKind::DestinationConnectionFailed,
                "Failed to begin SQLite transaction",
                err
            )
        })?;

        for statement in &ddl {
            debug!(statement, "executing ddl");
            if let Err(err) = sqlx::query(statement).execute(&mut *tx).await {
                error!(statement, error = %err, "ddl statement failed");
                report.record_failure("ddl", statement.as_str(), err);
            }
        }

        for batch in batches {
            let upsert = DIALECT.upsert(&batch.target, &batch.schema);
            let delete = DIALECT.delete(&batch.target);

            for change in &batch.changes {
                let result = match change {
                    RowChange::Upsert { row, .. } => {
                        upsert_query(&upsert, &batch.schema, row)
                            .execute(&mut *tx)
                            .await
                    }
                    RowChange::Delete { id } => {
                        sqlx::query(&delete)
                            .bind(id.as_str())
                            .execute(&mut *tx)
                            .await
                    }
                };

                match result {
                    Ok(_) => report.record_applied(),
                    Err(err) => {
                        error!(
                            table = %batch.target,
                            id = change.id(),
                            error = %err,
                            "failed to apply row"
                        );
                        report.record_failure(batch.target.as_str(), change.id(), err);
                    }
                }
            }
        }

        tx.commit().await.map_err(|err| {
            etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Failed to commit SQLite transaction",
                err
            )
        })?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::flatten::flatten;
    use crate::schema::{DocumentType, discover};
    use serde_json::{Value, json};
    use sqlx::Row;
    use std::sync::Arc;

    fn upsert(document: Value) -> RowChange {
        let document = document.as_object().cloned().unwrap();
        let row = flatten(&document);
        RowChange::Upsert {
            id: row.id().unwrap().to_string(),
            row,
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

    fn person(id: &str, age: f64) -> Value {
        json!({"_id": id, "_rev": "1-a", "name": "Jina", "age": age, "verified": true})
    }

    async fn count(destination: &SqliteDestination, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(destination.pool())
            .await
            .unwrap()
    }

    async fn prepared() -> (SqliteDestination, Arc<Schema>, Vec<String>) {
        let destination = SqliteDestination::in_memory().await.unwrap();
        destination.initialize(false).await.unwrap();

        let document = person("p1", 30.0);
        let schema = Arc::new(discover(&flatten(document.as_object().unwrap())));
        let ddl = destination.generate_ddl("people", &schema, false);

        (destination, schema, ddl)
    }

    #[tokio::test]
    async fn applies_ddl_and_rows() {
        let (destination, schema, ddl) = prepared().await;

        let report = destination
            .apply_batch(ddl, vec![batch("people", &schema, vec![upsert(person("p1", 30.0))])])
            .await
            .unwrap();

        assert_eq!(report.applied, 1);
        assert!(!report.has_failures());

        let row = sqlx::query("SELECT id, age, verified FROM people")
            .fetch_one(destination.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("id"), "p1");
        assert_eq!(row.get::<f64, _>("age"), 30.0);
        assert_eq!(row.get::<i64, _>("verified"), 1);
    }

    #[tokio::test]
    async fn reapplying_a_batch_keeps_row_count() {
        let (destination, schema, ddl) = prepared().await;
        let changes = vec![upsert(person("p1", 30.0)), upsert(person("p2", 41.0))];

        destination
            .apply_batch(ddl.clone(), vec![batch("people", &schema, changes.clone())])
            .await
            .unwrap();
        destination
            .apply_batch(ddl, vec![batch("people", &schema, changes)])
            .await
            .unwrap();

        assert_eq!(count(&destination, "people").await, 2);
    }

    #[tokio::test]
    async fn later_revision_replaces_row_and_delete_removes_it() {
        let (destination, schema, ddl) = prepared().await;

        destination
            .apply_batch(
                ddl,
                vec![batch(
                    "people",
                    &schema,
                    vec![upsert(person("p1", 30.0)), upsert(person("p1", 31.0))],
                )],
            )
            .await
            .unwrap();
        let age: f64 = sqlx::query_scalar("SELECT age FROM people WHERE id = 'p1'")
            .fetch_one(destination.pool())
            .await
            .unwrap();
        assert_eq!(age, 31.0);

        let report = destination
            .apply_batch(
                vec![],
                vec![batch(
                    "people",
                    &schema,
                    vec![RowChange::Delete { id: "p1".to_string() }],
                )],
            )
            .await
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(count(&destination, "people").await, 0);
    }

    #[tokio::test]
    async fn failing_rows_are_reported_without_aborting_the_batch() {
        let (destination, schema, ddl) = prepared().await;

        let report = destination
            .apply_batch(
                ddl,
                vec![
                    batch("missing_table", &schema, vec![upsert(person("x", 1.0))]),
                    batch("people", &schema, vec![upsert(person("p1", 30.0))]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].target, "missing_table");
        assert_eq!(report.failed[0].id, "x");
        assert_eq!(count(&destination, "people").await, 1);
    }

    #[tokio::test]
    async fn failing_ddl_is_reported() {
        let (destination, schema, _) = prepared().await;

        let report = destination
            .apply_batch(vec!["CREATE TABLE (".to_string()], vec![batch("people", &schema, vec![])])
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].target, "ddl");
    }

    #[tokio::test]
    async fn latest_checkpoint_wins_and_reset_forgets_it() {
        let destination = SqliteDestination::in_memory().await.unwrap();
        destination.initialize(false).await.unwrap();

        assert_eq!(destination.read_checkpoint("sampledata").await.unwrap(), None);

        destination
            .write_checkpoint("sampledata", &SequenceToken::from("10-abc"))
            .await
            .unwrap();
        destination
            .write_checkpoint("sampledata", &SequenceToken::from("20-def"))
            .await
            .unwrap();
        destination
            .write_checkpoint("other", &SequenceToken::from("99-x"))
            .await
            .unwrap();

        assert_eq!(
            destination.read_checkpoint("sampledata").await.unwrap(),
            Some(SequenceToken::from("20-def"))
        );

        destination.initialize(true).await.unwrap();
        assert_eq!(destination.read_checkpoint("sampledata").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_ddl_recreates_the_table() {
        let (destination, schema, ddl) = prepared().await;
        destination
            .apply_batch(ddl, vec![batch("people", &schema, vec![upsert(person("p1", 30.0))])])
            .await
            .unwrap();

        let reset_ddl = destination.generate_ddl("people", &schema, true);
        destination.apply_batch(reset_ddl, vec![]).await.unwrap();

        assert_eq!(count(&destination, "people").await, 0);
    }
}

use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use tracing::{debug, error, info};

use crate::checkpoint::base::CheckpointStore;
use crate::destination::base::{ApplyReport, Destination, RowChange, TargetBatch};
use crate::destination::sql::{Dialect, upsert_query};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::schema::Schema;
use crate::types::SequenceToken;

const DIALECT: Dialect = Dialect::MySql;

/// Destination writing into a MySQL database with `REPLACE INTO`.
///
/// MySQL commits DDL implicitly, so statements created for new targets are not rolled back
/// when the rest of the batch fails.
#[derive(Debug, Clone)]
pub struct MySqlDestination {
    pool: MySqlPool,
}

impl MySqlDestination {
    pub async fn connect(url: &str) -> EtlResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Failed to connect to MySQL",
                    err
                )
            })?;

        Ok(Self { pool })
    }
}

impl CheckpointStore for MySqlDestination {
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

impl Destination for MySqlDestination {
    fn name() -> &'static str {
        "mysql"
    }

    async fn initialize(&self, reset: bool) -> EtlResult<()> {
        if reset {
            info!("dropping mysql checkpoints");
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
                "Failed to begin MySQL transaction",
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
                "Failed to commit MySQL transaction",
                err
            )
        })?;

        Ok(report)
    }
}

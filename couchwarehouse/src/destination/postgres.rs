use config::shared::PgConnectionConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, error, info};

use crate::checkpoint::base::CheckpointStore;
use crate::destination::base::{ApplyReport, Destination, RowChange, TargetBatch};
use crate::destination::sql::{Dialect, upsert_query};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::schema::Schema;
use crate::types::SequenceToken;

const DIALECT: Dialect = Dialect::Postgres;

/// Name of the savepoint guarding each statement of a batch.
const ROW_SAVEPOINT: &str = "couchwarehouse_row";

/// Destination writing into a Postgres database.
///
/// Rows are upserted with `INSERT .. ON CONFLICT (id) DO UPDATE`. Every statement runs behind a
/// savepoint, so a failing row is rolled back alone and the surrounding transaction stays
/// usable.
#[derive(Debug, Clone)]
pub struct PostgresDestination {
    pool: PgPool,
}

impl PostgresDestination {
    pub async fn connect(config: &PgConnectionConfig) -> EtlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(config.connect_options())
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Failed to connect to Postgres",
                    err
                )
            })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Runs `statement` behind a savepoint, rolling back to it on failure.
async fn execute_guarded<'q>(
    connection: &mut PgConnection,
    statement: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("SAVEPOINT {ROW_SAVEPOINT}"))
        .execute(&mut *connection)
        .await?;

    match statement.execute(&mut *connection).await {
        Ok(_) => {
            sqlx::query(&format!("RELEASE SAVEPOINT {ROW_SAVEPOINT}"))
                .execute(&mut *connection)
                .await?;
            Ok(())
        }
        Err(err) => {
            sqlx::query(&format!("ROLLBACK TO SAVEPOINT {ROW_SAVEPOINT}"))
                .execute(&mut *connection)
                .await?;
            Err(err)
        }
    }
}

impl CheckpointStore for PostgresDestination {
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

impl Destination for PostgresDestination {
    fn name() -> &'static str {
        "postgres"
    }

    async fn initialize(&self, reset: bool) -> EtlResult<()> {
        if reset {
            info!("dropping postgres checkpoints");
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
                "Failed to begin Postgres transaction",
                err
            )
        })?;

        for statement in &ddl {
            debug!(statement, "executing ddl");
            if let Err(err) = execute_guarded(&mut tx, sqlx::query(statement)).await {
                error!(statement, error = %err, "ddl statement failed");
                report.record_failure("ddl", statement.as_str(), err);
            }
        }

        for batch in batches {
            let upsert = DIALECT.upsert(&batch.target, &batch.schema);
            let delete = DIALECT.delete(&batch.target);

            for change in &batch.changes {
                let statement = match change {
                    RowChange::Upsert { row, .. } => upsert_query(&upsert, &batch.schema, row),
                    RowChange::Delete { id } => sqlx::query(&delete).bind(id.as_str()),
                };

                match execute_guarded(&mut tx, statement).await {
                    Ok(()) => report.record_applied(),
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
                "Failed to commit Postgres transaction",
                err
            )
        })?;

        Ok(report)
    }
}

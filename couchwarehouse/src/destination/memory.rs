use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::checkpoint::base::CheckpointStore;
use crate::conversions::flatten::FlatRow;
use crate::destination::base::{ApplyReport, Destination, RowChange, TargetBatch, project_row};
use crate::error::EtlResult;
use crate::schema::Schema;
use crate::types::SequenceToken;

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<String, FlatRow>>,
    checkpoints: Vec<(String, SequenceToken)>,
    executed_ddl: Vec<String>,
}

/// Destination keeping every target as a map of rows by id.
///
/// DDL is simulated with `CREATE <target>` and `DROP <target>` statements, and writes to a
/// target that was never created fail like they would on a database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rows of `target` ordered by id.
    pub async fn rows(&self, target: &str) -> Vec<FlatRow> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(target)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, target: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.tables.get(target).map(|rows| rows.len()).unwrap_or(0)
    }

    /// Returns the names of all created targets, sorted.
    pub async fn targets(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut targets: Vec<_> = inner.tables.keys().cloned().collect();
        targets.sort();

        targets
    }

    /// Returns every checkpoint written, oldest first.
    pub async fn checkpoints(&self) -> Vec<(String, SequenceToken)> {
        self.inner.lock().await.checkpoints.clone()
    }

    pub async fn executed_ddl(&self) -> Vec<String> {
        self.inner.lock().await.executed_ddl.clone()
    }
}

impl Inner {
    fn execute(&mut self, statement: &str) -> Result<(), String> {
        match statement.split_once(' ') {
            Some(("CREATE", target)) => {
                self.tables.entry(target.to_string()).or_default();
            }
            Some(("DROP", target)) => {
                self.tables.remove(target);
            }
            _ => return Err(format!("unsupported statement: {statement}")),
        }
        self.executed_ddl.push(statement.to_string());

        Ok(())
    }

    fn apply(&mut self, target: &str, schema: &Schema, change: &RowChange) -> Result<(), String> {
        let Some(rows) = self.tables.get_mut(target) else {
            return Err(format!("no such target: {target}"));
        };

        match change {
            RowChange::Upsert { id, row, .. } => {
                let mut projected = FlatRow::with_capacity(schema.len());
                for (column, cell) in schema.column_schemas.iter().zip(project_row(schema, row)) {
                    projected.insert(column.name.clone(), cell);
                }
                rows.insert(id.clone(), projected);
            }
            RowChange::Delete { id } => {
                rows.remove(id);
            }
        }

        Ok(())
    }
}

impl CheckpointStore for MemoryDestination {
    async fn write_checkpoint(&self, key: &str, token: &SequenceToken) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoints.push((key.to_string(), token.clone()));

        Ok(())
    }

    async fn read_checkpoint(&self, key: &str) -> EtlResult<Option<SequenceToken>> {
        let inner = self.inner.lock().await;
        let token = inner
            .checkpoints
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, token)| token.clone());

        Ok(token)
    }
}

impl Destination for MemoryDestination {
    fn name() -> &'static str {
        "memory"
    }

    async fn initialize(&self, reset: bool) -> EtlResult<()> {
        if reset {
            info!("clearing in-memory checkpoints");
            self.inner.lock().await.checkpoints.clear();
        }

        Ok(())
    }

    fn generate_ddl(&self, target: &str, _schema: &Schema, reset: bool) -> Vec<String> {
        let mut statements = Vec::with_capacity(2);
        if reset {
            statements.push(format!("DROP {target}"));
        }
        statements.push(format!("CREATE {target}"));

        statements
    }

    async fn apply_batch(
        &self,
        ddl: Vec<String>,
        batches: Vec<TargetBatch>,
    ) -> EtlResult<ApplyReport> {
        let mut inner = self.inner.lock().await;
        let mut report = ApplyReport::default();

        for statement in &ddl {
            if let Err(reason) = inner.execute(statement) {
                report.record_failure("ddl", statement.as_str(), reason);
            }
        }

        for batch in &batches {
            debug!(
                table = %batch.target,
                changes = batch.changes.len(),
                "applying in-memory batch"
            );
            for change in &batch.changes {
                match inner.apply(&batch.target, &batch.schema, change) {
                    Ok(()) => report.record_applied(),
                    Err(reason) => {
                        report.record_failure(batch.target.as_str(), change.id(), reason)
                    }
                }
            }
        }

        Ok(report)
    }
}

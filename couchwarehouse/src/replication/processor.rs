use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bail;
use crate::checkpoint::base::checkpoint_key_for;
use crate::conversions::Cell;
use crate::conversions::flatten::{ID_COLUMN, flatten};
use crate::destination::base::{Destination, RowChange, TargetBatch};
use crate::error::{ErrorKind, EtlResult};
use crate::replication::transform::Transform;
use crate::schema::{
    ColumnSchema, ColumnType, DocumentType, Schema, SchemaRegistry, discover, discover_sample,
    is_eligible_sample,
};
use crate::types::{ChangeBatch, ChangeEvent, Document, SequenceToken};

/// Static settings of a [`BatchProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Name of the replicated database, used to derive target names and the checkpoint key.
    pub database: String,
    /// Top level field whose value selects the target of each document.
    pub split: Option<String>,
    /// Recreate every target the first time its document type is seen.
    pub reset: bool,
}

/// Outcome of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Events received, reserved ones included.
    pub events: usize,
    /// Events that produced no row change.
    pub skipped: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Totals over every batch handled by a processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub batches: u64,
    pub events: u64,
    pub skipped: u64,
    pub applied: u64,
    pub failed: u64,
    /// Token of the last checkpoint written.
    pub last_checkpoint: Option<SequenceToken>,
}

impl ProcessorStats {
    fn record(&mut self, report: &BatchReport, token: &SequenceToken) {
        self.batches += 1;
        self.events += report.events as u64;
        self.skipped += report.skipped as u64;
        self.applied += report.applied as u64;
        self.failed += report.failed as u64;
        self.last_checkpoint = Some(token.clone());
    }
}

/// Row changes of one batch grouped by target, in first-seen target order.
#[derive(Default)]
struct TargetBatches {
    batches: Vec<TargetBatch>,
    positions: HashMap<String, usize>,
}

impl TargetBatches {
    fn push(
        &mut self,
        target: String,
        document_type: &DocumentType,
        schema: &Arc<Schema>,
        change: RowChange,
    ) {
        let position = match self.positions.get(&target) {
            Some(position) => *position,
            None => {
                self.positions.insert(target.clone(), self.batches.len());
                self.batches.push(TargetBatch {
                    target,
                    document_type: document_type.clone(),
                    schema: schema.clone(),
                    changes: Vec::new(),
                });
                self.batches.len() - 1
            }
        };

        self.batches[position].changes.push(change);
    }

    fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn into_inner(self) -> Vec<TargetBatch> {
        self.batches
    }
}

/// Turns change batches into row changes and applies them to a destination.
///
/// Schemas are inferred from the first document of each type and frozen afterwards. The DDL
/// of newly seen types is sent along with the next applied batch, and the checkpoint is written
/// only once that batch was applied.
pub struct BatchProcessor<D> {
    destination: D,
    registry: SchemaRegistry,
    transform: Option<Arc<dyn Transform>>,
    options: ProcessorOptions,
    checkpoint_key: String,
    pending_ddl: Vec<String>,
    stats: ProcessorStats,
}

impl<D> BatchProcessor<D>
where
    D: Destination,
{
    pub fn new(destination: D, options: ProcessorOptions) -> Self {
        let checkpoint_key = checkpoint_key_for(&options.database);

        Self {
            destination,
            registry: SchemaRegistry::new(),
            transform: None,
            options,
            checkpoint_key,
            pending_ddl: Vec::new(),
            stats: ProcessorStats::default(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn checkpoint_key(&self) -> &str {
        &self.checkpoint_key
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    /// Seeds the registry from a discovery sample.
    ///
    /// The first eligible document defines the schema of its type. Its DDL is queued and
    /// executed with the next applied batch.
    pub async fn prime(&mut self, sample: Vec<Document>) -> EtlResult<()> {
        let documents: Vec<Document> = sample
            .into_iter()
            .filter(is_eligible_sample)
            .map(|document| self.transform_document(document))
            .collect();

        let Some((document, schema)) = discover_sample(&documents) else {
            bail!(
                ErrorKind::SchemaDiscoveryFailed,
                "No eligible document to infer a schema from",
                self.options.database
            );
        };

        let document_type = DocumentType::classify(document, self.options.split.as_deref());
        self.register(document_type, schema).await?;

        Ok(())
    }

    /// Applies one batch and checkpoints its last token.
    pub async fn process(&mut self, batch: ChangeBatch) -> EtlResult<BatchReport> {
        let Some(last_token) = batch.last().map(|event| event.sequence.clone()) else {
            return Ok(BatchReport::default());
        };

        let mut report = BatchReport {
            events: batch.len(),
            ..Default::default()
        };
        let mut targets = TargetBatches::default();

        for event in batch {
            if event.is_design() {
                report.skipped += 1;
                continue;
            }

            if event.deleted {
                if !self.route_deletion(&event, &mut targets).await? {
                    report.skipped += 1;
                }
                continue;
            }

            let Some(document) = event.document else {
                warn!(id = %event.id, "change without document body, skipping");
                report.skipped += 1;
                continue;
            };

            let document = self.transform_document(document);
            let mut row = flatten(&document);
            if row.id().is_none() {
                row.insert(ID_COLUMN, Cell::Text(event.id.clone()));
            }

            let document_type =
                DocumentType::classify(&document, self.options.split.as_deref());
            let schema = match self.registry.schema_for(&document_type).await {
                Some(schema) => schema,
                None => self.register(document_type.clone(), discover(&row)).await?,
            };

            let target = self.target_name(&document_type)?;
            let change = RowChange::Upsert {
                id: event.id,
                row,
                document,
            };
            targets.push(target, &document_type, &schema, change);
        }

        if !targets.is_empty() {
            let ddl = mem::take(&mut self.pending_ddl);
            let apply_report = self
                .destination
                .apply_batch(ddl, targets.into_inner())
                .await?;

            report.applied = apply_report.applied;
            report.failed = apply_report.failed.len();
            if apply_report.has_failures() {
                warn!(
                    failed = apply_report.failed.len(),
                    applied = apply_report.applied,
                    "batch applied with failures"
                );
            }
        }

        self.destination
            .write_checkpoint(&self.checkpoint_key, &last_token)
            .await?;
        self.stats.record(&report, &last_token);

        debug!(
            events = report.events,
            skipped = report.skipped,
            applied = report.applied,
            failed = report.failed,
            seq = %last_token,
            "processed batch"
        );

        Ok(report)
    }

    fn transform_document(&self, document: Document) -> Document {
        match &self.transform {
            Some(transform) => transform.apply(document),
            None => document,
        }
    }

    /// Returns the target of `document_type`, failing if its name sanitizes to nothing.
    fn target_name(&self, document_type: &DocumentType) -> EtlResult<String> {
        let target = self.destination.target_name_for(
            &self.options.database,
            document_type,
            self.options.split.is_some(),
        );
        if target.is_empty() {
            bail!(
                ErrorKind::DestinationTableNameInvalid,
                "Target name is empty after sanitizing",
                format!("database {:?}, type {document_type}", self.options.database)
            );
        }

        Ok(target)
    }

    /// Registers `schema` for `document_type` and queues its DDL, returning the schema the
    /// registry holds afterwards.
    async fn register(
        &mut self,
        document_type: DocumentType,
        mut schema: Schema,
    ) -> EtlResult<Arc<Schema>> {
        if !schema.contains(ID_COLUMN) {
            schema
                .column_schemas
                .push(ColumnSchema::new(ID_COLUMN, ColumnType::Text));
        }

        let target = self.target_name(&document_type)?;
        if self.registry.register(document_type.clone(), schema.clone()).await {
            debug!(%document_type, table = %target, columns = schema.len(), "registered schema");
            self.pending_ddl.extend(
                self.destination
                    .generate_ddl(&target, &schema, self.options.reset),
            );
        }

        let schema = self
            .registry
            .schema_for(&document_type)
            .await
            .unwrap_or_else(|| Arc::new(schema));

        Ok(schema)
    }

    /// Queues the deletion of `event` into every target it may live in.
    ///
    /// Only targets whose type has a registered schema are considered, as no other target was
    /// created yet. Returns `false` if none is left.
    async fn route_deletion(
        &self,
        event: &ChangeEvent,
        targets: &mut TargetBatches,
    ) -> EtlResult<bool> {
        let document_types = match (&self.options.split, &event.document) {
            (None, _) => vec![DocumentType::Default],
            (Some(split), Some(tombstone)) if tombstone.contains_key(split) => {
                vec![DocumentType::classify(tombstone, Some(split.as_str()))]
            }
            (Some(_), _) => self
                .registry
                .entries()
                .await
                .into_iter()
                .map(|(document_type, _)| document_type)
                .collect(),
        };

        let mut routed = false;
        for document_type in document_types {
            let Some(schema) = self.registry.schema_for(&document_type).await else {
                continue;
            };

            let target = self.target_name(&document_type)?;
            let change = RowChange::Delete {
                id: event.id.clone(),
            };
            targets.push(target, &document_type, &schema, change);
            routed = true;
        }

        if !routed {
            debug!(id = %event.id, "deletion without a created target, skipping");
        }

        Ok(routed)
    }
}

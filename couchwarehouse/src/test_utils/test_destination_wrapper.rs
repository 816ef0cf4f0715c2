use std::fmt;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

use crate::checkpoint::base::CheckpointStore;
use crate::destination::base::{ApplyReport, Destination, TargetBatch};
use crate::error::{EtlError, EtlResult};
use crate::schema::{DocumentType, Schema};
use crate::types::SequenceToken;

type CheckpointCondition = Box<dyn Fn(&[SequenceToken]) -> bool + Send + Sync>;
type BatchCondition = Box<dyn Fn(&[TargetBatch]) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    applied_batches: Vec<TargetBatch>,
    checkpoints: Vec<SequenceToken>,
    apply_calls: usize,
    next_apply_error: Option<EtlError>,
    checkpoint_conditions: Vec<(CheckpointCondition, Arc<Notify>)>,
    batch_conditions: Vec<(BatchCondition, Arc<Notify>)>,
}

impl Inner {
    fn check_conditions(&mut self) {
        let checkpoints = &self.checkpoints;
        self.checkpoint_conditions.retain(|(condition, notify)| {
            let should_retain = !condition(checkpoints);
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });

        let batches = &self.applied_batches;
        self.batch_conditions.retain(|(condition, notify)| {
            let should_retain = !condition(batches);
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });
    }
}

/// Wraps a destination, recording what reaches it and optionally failing a unit of work.
#[derive(Clone)]
pub struct TestDestinationWrapper<D> {
    wrapped_destination: D,
    inner: Arc<RwLock<Inner>>,
}

impl<D> fmt::Debug for TestDestinationWrapper<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDestinationWrapper").finish_non_exhaustive()
    }
}

impl<D> TestDestinationWrapper<D> {
    pub fn wrap(destination: D) -> Self {
        Self {
            wrapped_destination: destination,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn wrapped(&self) -> &D {
        &self.wrapped_destination
    }

    /// Makes the next `apply_batch` fail as a whole with `error`, before reaching the wrapped
    /// destination.
    pub async fn fail_next_apply(&self, error: EtlError) {
        self.inner.write().await.next_apply_error = Some(error);
    }

    /// Returns every target batch applied without a unit of work failure.
    pub async fn applied_batches(&self) -> Vec<TargetBatch> {
        self.inner.read().await.applied_batches.clone()
    }

    /// Returns every checkpoint written through the wrapper, oldest first.
    pub async fn written_checkpoints(&self) -> Vec<SequenceToken> {
        self.inner.read().await.checkpoints.clone()
    }

    /// Number of `apply_batch` calls, failed ones included.
    pub async fn apply_calls(&self) -> usize {
        self.inner.read().await.apply_calls
    }

    pub async fn notify_on_checkpoints<F>(&self, condition: F) -> Arc<Notify>
    where
        F: Fn(&[SequenceToken]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner
            .checkpoint_conditions
            .push((Box::new(condition), notify.clone()));
        inner.check_conditions();

        notify
    }

    /// Notifies once a checkpoint equal to `token` was written.
    pub async fn wait_for_checkpoint(&self, token: SequenceToken) -> Arc<Notify> {
        self.notify_on_checkpoints(move |checkpoints| checkpoints.contains(&token))
            .await
    }

    pub async fn notify_on_batches<F>(&self, condition: F) -> Arc<Notify>
    where
        F: Fn(&[TargetBatch]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner
            .batch_conditions
            .push((Box::new(condition), notify.clone()));
        inner.check_conditions();

        notify
    }

    /// Notifies once at least `count` row changes were applied.
    pub async fn wait_for_row_changes(&self, count: usize) -> Arc<Notify> {
        self.notify_on_batches(move |batches| {
            batches.iter().map(|batch| batch.changes.len()).sum::<usize>() >= count
        })
        .await
    }
}

impl<D> CheckpointStore for TestDestinationWrapper<D>
where
    D: Destination + Sync,
{
    async fn write_checkpoint(&self, key: &str, token: &SequenceToken) -> EtlResult<()> {
        let result = self.wrapped_destination.write_checkpoint(key, token).await;

        let mut inner = self.inner.write().await;
        if result.is_ok() {
            inner.checkpoints.push(token.clone());
        }
        inner.check_conditions();

        result
    }

    async fn read_checkpoint(&self, key: &str) -> EtlResult<Option<SequenceToken>> {
        self.wrapped_destination.read_checkpoint(key).await
    }
}

impl<D> Destination for TestDestinationWrapper<D>
where
    D: Destination + Sync,
{
    fn name() -> &'static str {
        D::name()
    }

    async fn initialize(&self, reset: bool) -> EtlResult<()> {
        self.wrapped_destination.initialize(reset).await
    }

    fn generate_ddl(&self, target: &str, schema: &Schema, reset: bool) -> Vec<String> {
        self.wrapped_destination.generate_ddl(target, schema, reset)
    }

    async fn apply_batch(
        &self,
        ddl: Vec<String>,
        batches: Vec<TargetBatch>,
    ) -> EtlResult<ApplyReport> {
        {
            let mut inner = self.inner.write().await;
            inner.apply_calls += 1;
            if let Some(error) = inner.next_apply_error.take() {
                return Err(error);
            }
        }

        let result = self
            .wrapped_destination
            .apply_batch(ddl, batches.clone())
            .await;

        let mut inner = self.inner.write().await;
        if result.is_ok() {
            inner.applied_batches.extend(batches);
        }
        inner.check_conditions();

        result
    }

    fn target_name_for(&self, database: &str, document_type: &DocumentType, split: bool) -> String {
        self.wrapped_destination
            .target_name_for(database, document_type, split)
    }
}

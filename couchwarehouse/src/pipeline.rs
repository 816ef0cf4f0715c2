//! Replication orchestration.
//!
//! A [`Pipeline`] drives one database through its phases: it prepares the destination, infers
//! the initial schema from a sample, catches up with every change up to the latest position
//! and then follows new changes until it is stopped or fails.

use config::shared::{PipelineConfig, SourceConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};

use crate::bail;
use crate::concurrency::feed::{ChangeFeed, FeedItem, FeedOptions};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::destination::Destination;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::replication::processor::{BatchProcessor, ProcessorOptions};
use crate::replication::transform::Transform;
use crate::source::base::ChangeSource;
use crate::types::SequenceToken;

/// Phase a pipeline is in, observable through [`Pipeline::subscribe_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Init,
    DiscoveringSchema,
    CatchingUp,
    Tailing,
    Stopped,
    Errored,
}

impl PipelinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelinePhase::Stopped | PipelinePhase::Errored)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelinePhase::Init => "init",
            PipelinePhase::DiscoveringSchema => "discovering_schema",
            PipelinePhase::CatchingUp => "catching_up",
            PipelinePhase::Tailing => "tailing",
            PipelinePhase::Stopped => "stopped",
            PipelinePhase::Errored => "errored",
        };

        f.write_str(name)
    }
}

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started { handle: JoinHandle<EtlResult<()>> },
}

/// How following a feed ended.
enum FeedOutcome {
    Finished(SequenceToken),
    Shutdown,
}

/// Replicates the changes of one database into a destination.
///
/// The pipeline owns its source and destination. After [`Pipeline::start`] a single task runs
/// the phases in order and processes one batch at a time; [`Pipeline::stop`] is observed
/// between batches, so a batch handed to the processor is always applied and checkpointed
/// before the pipeline stops.
pub struct Pipeline<S, D> {
    source_config: Arc<SourceConfig>,
    config: Arc<PipelineConfig>,
    source: S,
    destination: D,
    transform: Option<Arc<dyn Transform>>,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
    phase_tx: watch::Sender<PipelinePhase>,
}

impl<S, D> Pipeline<S, D>
where
    S: ChangeSource + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    /// Creates a pipeline that is started with [`Pipeline::start`].
    ///
    /// A missing `batch.buffer_size` means reliable mode: every batch is applied before the
    /// next one is fetched.
    pub fn new(
        source_config: SourceConfig,
        config: PipelineConfig,
        source: S,
        destination: D,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();
        let (phase_tx, _) = watch::channel(PipelinePhase::Init);

        Self {
            source_config: Arc::new(source_config),
            config: Arc::new(config),
            source,
            destination,
            transform: None,
            state: PipelineState::NotStarted,
            shutdown_tx,
            phase_tx,
        }
    }

    /// Applies `transform` to every document before it is flattened.
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn database(&self) -> &str {
        &self.source_config.database
    }

    /// Returns a handle that stops this pipeline when signaled.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub fn phase(&self) -> PipelinePhase {
        *self.phase_tx.borrow()
    }

    /// Returns a receiver observing every phase change.
    pub fn subscribe_phase(&self) -> watch::Receiver<PipelinePhase> {
        self.phase_tx.subscribe()
    }

    /// Spawns the replication task.
    pub async fn start(&mut self) -> EtlResult<()> {
        if let PipelineState::Started { .. } = self.state {
            bail!(ErrorKind::InvalidState, "The pipeline was already started");
        }

        info!(
            database = %self.source_config.database,
            destination = D::name(),
            "starting pipeline"
        );

        let mut processor = BatchProcessor::new(
            self.destination.clone(),
            ProcessorOptions {
                database: self.source_config.database.clone(),
                split: self.config.split.clone(),
                reset: self.config.reset,
            },
        );
        if let Some(transform) = &self.transform {
            processor = processor.with_transform(transform.clone());
        }

        let run = PipelineRun {
            source_config: self.source_config.clone(),
            config: self.config.clone(),
            source: self.source.clone(),
            processor,
            shutdown_rx: self.shutdown_tx.subscribe(),
            phase_tx: self.phase_tx.clone(),
        };

        let span = info_span!("pipeline", database = %self.source_config.database);
        let handle = tokio::spawn(run.run().instrument(span));
        self.state = PipelineState::Started { handle };

        Ok(())
    }

    /// Waits for the replication task to end and returns its error, if any.
    pub async fn wait(self) -> EtlResult<()> {
        let PipelineState::Started { handle } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        handle.await.map_err(|err| {
            etl_error!(
                ErrorKind::PipelineTaskPanic,
                "The pipeline task panicked",
                err
            )
        })?
    }

    /// Asks the pipeline to stop after the batch it is currently processing.
    pub fn stop(&self) {
        let phase = self.phase();
        if phase.is_terminal() {
            info!(%phase, "pipeline already finished, nothing to stop");
            return;
        }

        info!("trying to stop the pipeline");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the pipeline: {}", err);
            return;
        }

        info!("shut down signal successfully sent to the pipeline");
    }

    pub fn shutdown(&self) {
        self.stop();
    }

    /// Stops the pipeline and waits for it to end.
    pub async fn shutdown_and_wait(self) -> EtlResult<()> {
        self.stop();
        self.wait().await
    }
}

/// State moved into the replication task.
struct PipelineRun<S, D> {
    source_config: Arc<SourceConfig>,
    config: Arc<PipelineConfig>,
    source: S,
    processor: BatchProcessor<D>,
    shutdown_rx: ShutdownRx,
    phase_tx: watch::Sender<PipelinePhase>,
}

impl<S, D> PipelineRun<S, D>
where
    S: ChangeSource + Clone + Send + Sync + 'static,
    D: Destination + Send + Sync,
{
    async fn run(mut self) -> EtlResult<()> {
        let result = self.replicate().await;

        let stats = self.processor.stats();
        match &result {
            Ok(()) => {
                info!(
                    batches = stats.batches,
                    applied = stats.applied,
                    failed = stats.failed,
                    "pipeline stopped"
                );
                self.set_phase(PipelinePhase::Stopped);
            }
            Err(err) => {
                error!(error = %err, batches = stats.batches, "pipeline failed");
                self.set_phase(PipelinePhase::Errored);
            }
        }

        result
    }

    async fn replicate(&mut self) -> EtlResult<()> {
        self.set_phase(PipelinePhase::Init);
        self.processor
            .destination()
            .initialize(self.config.reset)
            .await?;
        if self.shutdown_requested() {
            return Ok(());
        }

        self.set_phase(PipelinePhase::DiscoveringSchema);
        let latest = self.source.fetch_latest_token().await?;
        let resume_from = self.resume_position().await?;
        let sample = self
            .source
            .fetch_sample(self.source_config.sample_size)
            .await?;
        self.processor.prime(sample).await?;
        let schemas = self.processor.registry().len().await;
        info!(
            from = %resume_from,
            latest = %latest,
            schemas,
            "schema discovered"
        );
        if self.shutdown_requested() {
            return Ok(());
        }

        self.set_phase(PipelinePhase::CatchingUp);
        let feed = ChangeFeed::spool(self.source.clone(), resume_from, self.feed_options());
        let caught_up_to = match self.follow(feed, Some(&latest)).await? {
            FeedOutcome::Finished(token) => token,
            FeedOutcome::Shutdown => return Ok(()),
        };
        info!(seq = %caught_up_to, "caught up, following new changes");

        self.set_phase(PipelinePhase::Tailing);
        let feed = ChangeFeed::tail(self.source.clone(), caught_up_to, self.feed_options());
        match self.follow(feed, None).await? {
            FeedOutcome::Shutdown => Ok(()),
            FeedOutcome::Finished(token) => {
                bail!(
                    ErrorKind::FeedClosed,
                    "The change feed ended while tailing",
                    token.to_string()
                )
            }
        }
    }

    /// Returns the position to read changes from.
    ///
    /// That is the stored checkpoint unless resetting, then the configured start position,
    /// then the beginning of the feed.
    async fn resume_position(&self) -> EtlResult<SequenceToken> {
        if !self.config.reset
            && let Some(token) = self
                .processor
                .destination()
                .read_checkpoint(self.processor.checkpoint_key())
                .await?
        {
            info!(seq = %token, "resuming from checkpoint");
            return Ok(token);
        }

        let token = match &self.source_config.since {
            Some(since) => SequenceToken::from(since.as_str()),
            None => SequenceToken::start(),
        };

        Ok(token)
    }

    fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            batch_size: self.config.batch.max_size,
            buffer_size: self.config.batch.buffer_size.unwrap_or(0),
            longpoll_timeout: Duration::from_millis(self.source_config.longpoll_timeout_ms),
        }
    }

    /// Processes the batches of `feed` until it finishes, fails or a shutdown is requested.
    async fn follow(
        &mut self,
        mut feed: ChangeFeed,
        latest: Option<&SequenceToken>,
    ) -> EtlResult<FeedOutcome> {
        let outcome = self.drain(&mut feed, latest).await;
        let closed = feed.close().await;

        let outcome = outcome?;
        closed?;

        Ok(outcome)
    }

    async fn drain(
        &mut self,
        feed: &mut ChangeFeed,
        latest: Option<&SequenceToken>,
    ) -> EtlResult<FeedOutcome> {
        let target = latest.and_then(SequenceToken::numeric_prefix);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    info!("shutdown requested, stopping the change feed");
                    return Ok(FeedOutcome::Shutdown);
                }

                item = feed.next() => {
                    let Some(item) = item else {
                        return Err(etl_error!(
                            ErrorKind::FeedClosed,
                            "The change feed stopped unexpectedly"
                        ));
                    };

                    match item? {
                        FeedItem::Batch(mut delivery) => {
                            let events = delivery.take_events();
                            let report = self.processor.process(events).await?;

                            let seq = delivery.last_seq().clone();
                            match (seq.numeric_prefix(), target) {
                                (Some(current), Some(target)) => {
                                    info!(events = report.events, "replicated {current}/{target}");
                                }
                                _ => debug!(events = report.events, seq = %seq, "replicated batch"),
                            }

                            delivery.complete();
                        }
                        FeedItem::Finished(token) => return Ok(FeedOutcome::Finished(token)),
                    }
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown_rx.has_changed().unwrap_or(true)
    }

    fn set_phase(&self, phase: PipelinePhase) {
        debug!(%phase, "pipeline phase changed");
        self.phase_tx.send_replace(phase);
    }
}

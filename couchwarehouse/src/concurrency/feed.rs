use std::mem;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span};

use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::source::base::{ChangeSource, ChangesRequest, FeedMode};
use crate::types::{ChangeBatch, ChangeEvent, SequenceToken};

/// Tuning of a [`ChangeFeed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedOptions {
    /// Maximum number of events requested per page.
    pub batch_size: usize,
    /// Number of batches fetched ahead of the consumer.
    ///
    /// With `0` the producer waits for every batch to be completed before fetching the next
    /// one.
    pub buffer_size: usize,
    /// How long a tailing request is held open by the source.
    pub longpoll_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedKind {
    Spool,
    Tail,
}

/// A batch handed to the consumer of a feed.
#[derive(Debug)]
pub struct Delivery {
    events: ChangeBatch,
    last_seq: SequenceToken,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    fn new(
        events: ChangeBatch,
        last_seq: SequenceToken,
        acknowledged: bool,
    ) -> (Self, Option<oneshot::Receiver<()>>) {
        let (ack, ack_rx) = if acknowledged {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let delivery = Self {
            events,
            last_seq,
            ack,
        };

        (delivery, ack_rx)
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Moves the events out of the delivery, leaving it empty.
    pub fn take_events(&mut self) -> ChangeBatch {
        mem::take(&mut self.events)
    }

    /// Token reported by the source after this batch.
    pub fn last_seq(&self) -> &SequenceToken {
        &self.last_seq
    }

    /// Signals that the batch was fully handled, letting an unbuffered feed fetch the next one.
    ///
    /// Dropping a delivery without completing it stops an unbuffered feed.
    pub fn complete(mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

#[derive(Debug)]
pub enum FeedItem {
    Batch(Delivery),
    /// The spool reached the end of the stream as it was when the feed started.
    Finished(SequenceToken),
}

/// A background reader of the source change stream.
///
/// The feed fetches pages on its own task and hands them over through a bounded channel, so a
/// slow consumer applies backpressure to the source. Fetch errors are delivered as the last
/// item of the feed.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::Receiver<EtlResult<FeedItem>>,
    cancel_tx: ShutdownTx,
    handle: JoinHandle<()>,
}

impl ChangeFeed {
    /// Reads the stream from `since` until the source reports nothing pending, then yields
    /// [`FeedItem::Finished`] and ends.
    pub fn spool<S>(source: S, since: SequenceToken, options: FeedOptions) -> Self
    where
        S: ChangeSource + Clone + Send + Sync + 'static,
    {
        Self::start(source, since, options, FeedKind::Spool)
    }

    /// Follows the stream from `since` with long-poll requests until cancelled.
    pub fn tail<S>(source: S, since: SequenceToken, options: FeedOptions) -> Self
    where
        S: ChangeSource + Clone + Send + Sync + 'static,
    {
        Self::start(source, since, options, FeedKind::Tail)
    }

    fn start<S>(source: S, since: SequenceToken, options: FeedOptions, kind: FeedKind) -> Self
    where
        S: ChangeSource + Clone + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        let (cancel_tx, mut cancel_rx) = create_shutdown_channel();

        let span = info_span!("change_feed", kind = ?kind, since = %since);
        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    biased;

                    _ = cancel_rx.changed() => {
                        debug!("change feed cancelled");
                    }
                    _ = produce(source, since, options, kind, tx) => {
                        debug!("change feed producer finished");
                    }
                }
            }
            .instrument(span),
        );

        Self {
            rx,
            cancel_tx,
            handle,
        }
    }

    /// Returns the next item, or [`None`] once the feed ended or was cancelled.
    pub async fn next(&mut self) -> Option<EtlResult<FeedItem>> {
        self.rx.recv().await
    }

    /// Stops the producer. Items already buffered can still be received.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.shutdown();
    }

    /// Cancels the feed and waits for its producer task to exit.
    pub async fn close(self) -> EtlResult<()> {
        self.cancel();
        drop(self.rx);

        self.handle.await.map_err(|err| {
            etl_error!(
                ErrorKind::PipelineTaskPanic,
                "Change feed task failed",
                err
            )
        })
    }
}

async fn produce<S>(
    source: S,
    mut since: SequenceToken,
    options: FeedOptions,
    kind: FeedKind,
    tx: mpsc::Sender<EtlResult<FeedItem>>,
) where
    S: ChangeSource,
{
    let mode = match kind {
        FeedKind::Spool => FeedMode::Normal,
        FeedKind::Tail => FeedMode::LongPoll {
            timeout: options.longpoll_timeout,
        },
    };

    loop {
        let request = ChangesRequest {
            since: since.clone(),
            limit: options.batch_size,
            mode,
        };

        let page = match source.fetch_changes(request).await {
            Ok(page) => page,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        let is_last = page.is_last();
        since = page.last_seq.clone();

        if !page.events.is_empty() {
            debug!(events = page.events.len(), last_seq = %page.last_seq, "fetched changes page");

            let (delivery, ack_rx) =
                Delivery::new(page.events, page.last_seq, options.buffer_size == 0);
            if tx.send(Ok(FeedItem::Batch(delivery))).await.is_err() {
                return;
            }

            if let Some(ack_rx) = ack_rx
                && ack_rx.await.is_err()
            {
                debug!("batch dropped without completion, stopping change feed");
                return;
            }
        }

        if kind == FeedKind::Spool && is_last {
            let _ = tx.send(Ok(FeedItem::Finished(since))).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::source::MemorySource;
    use serde_json::json;

    fn options(batch_size: usize, buffer_size: usize) -> FeedOptions {
        FeedOptions {
            batch_size,
            buffer_size,
            longpoll_timeout: Duration::from_millis(50),
        }
    }

    fn source_with(count: usize) -> MemorySource {
        let source = MemorySource::new();
        for i in 0..count {
            source.put(json!({"_id": format!("doc{i}"), "n": i}));
        }
        source
    }

    async fn next_batch(feed: &mut ChangeFeed) -> Delivery {
        match feed.next().await {
            Some(Ok(FeedItem::Batch(delivery))) => delivery,
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spool_delivers_pages_then_finishes() {
        let source = source_with(5);
        let mut feed = ChangeFeed::spool(source.clone(), SequenceToken::start(), options(2, 4));

        let mut ids = Vec::new();
        let finished = loop {
            match feed.next().await {
                Some(Ok(FeedItem::Batch(mut delivery))) => {
                    ids.extend(delivery.take_events().into_iter().map(|e| e.id));
                    delivery.complete();
                }
                Some(Ok(FeedItem::Finished(token))) => break token,
                other => panic!("unexpected feed item {other:?}"),
            }
        };

        assert_eq!(ids, ["doc0", "doc1", "doc2", "doc3", "doc4"]);
        assert_eq!(finished, source.latest_token());
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn spool_of_empty_stream_finishes_at_start_token() {
        let source = MemorySource::new();
        let mut feed = ChangeFeed::spool(source, SequenceToken::start(), options(10, 0));

        match feed.next().await {
            Some(Ok(FeedItem::Finished(token))) => assert_eq!(token, SequenceToken::start()),
            other => panic!("unexpected feed item {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbuffered_feed_waits_for_completion() {
        let source = source_with(4);
        let mut feed = ChangeFeed::spool(source.clone(), SequenceToken::start(), options(2, 0));

        let first = next_batch(&mut feed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.requests().len(), 1);

        first.complete();
        let second = next_batch(&mut feed).await;
        assert_eq!(second.events()[0].id, "doc2");
        assert_eq!(source.requests().len(), 2);
    }

    #[tokio::test]
    async fn fetch_errors_end_the_feed() {
        let source = source_with(1);
        source.fail_next_fetch(etl_error!(ErrorKind::SourceQueryFailed, "Boom"));

        let mut feed = ChangeFeed::spool(source, SequenceToken::start(), options(10, 1));

        let err = match feed.next().await {
            Some(Err(err)) => err,
            other => panic!("expected an error, got {other:?}"),
        };
        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn tail_follows_new_changes_until_cancelled() {
        let source = source_with(1);
        let since = source.latest_token();
        let mut feed = ChangeFeed::tail(source.clone(), since, options(10, 0));

        source.put(json!({"_id": "late", "n": 1}));
        let delivery = next_batch(&mut feed).await;
        assert_eq!(delivery.events().len(), 1);
        assert_eq!(delivery.events()[0].id, "late");
        delivery.complete();

        feed.close().await.unwrap();
    }

    #[tokio::test]
    async fn tail_sends_long_poll_requests() {
        let source = MemorySource::new();
        let mut feed = ChangeFeed::tail(source.clone(), SequenceToken::start(), options(10, 0));

        source.put(json!({"_id": "a"}));
        next_batch(&mut feed).await.complete();
        feed.cancel();

        let requests = source.requests();
        assert!(
            requests
                .iter()
                .all(|r| matches!(r.mode, FeedMode::LongPoll { .. }))
        );
    }
}

use std::future::Future;
use std::time::Duration;

use crate::error::EtlResult;
use crate::types::{ChangeEvent, Document, SequenceToken};

/// How a changes request waits for new events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Return immediately with whatever is available.
    Normal,
    /// Hold the request open until at least one change arrives or `timeout` elapses.
    LongPoll { timeout: Duration },
}

/// A request for one page of the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesRequest {
    /// Changes strictly after this token are returned.
    pub since: SequenceToken,
    /// Maximum number of changes in the page.
    pub limit: usize,
    pub mode: FeedMode,
}

/// One page of the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesPage {
    pub events: Vec<ChangeEvent>,
    /// Token to resume from after this page.
    pub last_seq: SequenceToken,
    /// Number of changes remaining after this page, when the source reports it.
    pub pending: Option<u64>,
}

impl ChangesPage {
    /// Returns `true` if the source has nothing left after this page.
    pub fn is_last(&self) -> bool {
        match self.pending {
            Some(pending) => pending == 0,
            None => self.events.is_empty(),
        }
    }
}

/// Source of an ordered document change stream.
///
/// Implementations only fetch single pages. Continuous spool and tail reads with
/// backpressure are built on top by [`crate::concurrency::feed::ChangeFeed`].
pub trait ChangeSource {
    /// Returns the token of the most recent change, used as the catch-up target.
    fn fetch_latest_token(&self) -> impl Future<Output = EtlResult<SequenceToken>> + Send;

    /// Returns up to `limit` current documents for schema discovery.
    fn fetch_sample(&self, limit: usize) -> impl Future<Output = EtlResult<Vec<Document>>> + Send;

    /// Returns the page of changes following `request.since`.
    fn fetch_changes(
        &self,
        request: ChangesRequest,
    ) -> impl Future<Output = EtlResult<ChangesPage>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(events: usize, pending: Option<u64>) -> ChangesPage {
        let events = (0..events)
            .map(|i| ChangeEvent {
                sequence: SequenceToken::new(i.to_string()),
                id: format!("doc{i}"),
                document: None,
                deleted: false,
            })
            .collect();

        ChangesPage {
            events,
            last_seq: SequenceToken::new("9"),
            pending,
        }
    }

    #[test]
    fn pending_count_decides_the_last_page() {
        assert!(page(3, Some(0)).is_last());
        assert!(!page(3, Some(10)).is_last());
        assert!(!page(0, Some(10)).is_last());
    }

    #[test]
    fn empty_page_is_last_without_pending_count() {
        assert!(page(0, None).is_last());
        assert!(!page(1, None).is_last());
    }
}

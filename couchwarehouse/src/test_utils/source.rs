use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::error::{EtlError, EtlResult};
use crate::source::base::{ChangeSource, ChangesPage, ChangesRequest, FeedMode};
use crate::types::{ChangeEvent, Document, SequenceToken};

#[derive(Debug, Default)]
struct Inner {
    events: Vec<ChangeEvent>,
    requests: Vec<ChangesRequest>,
    next_fetch_error: Option<EtlError>,
    sample_error: Option<EtlError>,
}

/// In-memory change stream behaving like a single database.
///
/// Every write appends an event with token `"<n>-mem"`, where `n` is the position of the event
/// in the stream starting at 1.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a write of `document`, which must be an object carrying `_id`.
    pub fn put(&self, document: Value) -> SequenceToken {
        let document = document.as_object().cloned().unwrap_or_default();
        let id = document
            .get("_id")
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();

        self.append(id, Some(document), false)
    }

    /// Appends a deletion of `id`.
    pub fn delete(&self, id: &str) -> SequenceToken {
        self.append(id.to_string(), None, true)
    }

    pub fn put_all<I>(&self, documents: I) -> SequenceToken
    where
        I: IntoIterator<Item = Value>,
    {
        let mut last = self.latest_token();
        for document in documents {
            last = self.put(document);
        }

        last
    }

    fn append(&self, id: String, document: Option<Document>, deleted: bool) -> SequenceToken {
        let token = {
            let mut inner = self.lock();
            let token = SequenceToken::new(format!("{}-mem", inner.events.len() + 1));
            inner.events.push(ChangeEvent {
                sequence: token.clone(),
                id,
                document,
                deleted,
            });
            token
        };
        self.appended.notify_waiters();

        token
    }

    pub fn latest_token(&self) -> SequenceToken {
        self.lock()
            .events
            .last()
            .map(|event| event.sequence.clone())
            .unwrap_or_else(SequenceToken::start)
    }

    /// Returns every changes request received so far.
    pub fn requests(&self) -> Vec<ChangesRequest> {
        self.lock().requests.clone()
    }

    /// Makes the next changes request fail with `err`.
    pub fn fail_next_fetch(&self, err: EtlError) {
        self.lock().next_fetch_error = Some(err);
    }

    /// Makes every sample request fail with `err`.
    pub fn fail_sample(&self, err: EtlError) {
        self.lock().sample_error = Some(err);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_index(events: &[ChangeEvent], since: &SequenceToken) -> usize {
        if since.as_str() == "now" {
            return events.len();
        }

        events
            .iter()
            .position(|event| &event.sequence == since)
            .map(|position| position + 1)
            .or_else(|| since.numeric_prefix().map(|n| n as usize))
            .unwrap_or(0)
            .min(events.len())
    }

    fn page(&self, request: &ChangesRequest) -> ChangesPage {
        let inner = self.lock();
        let start = Self::start_index(&inner.events, &request.since);
        let end = (start + request.limit).min(inner.events.len());

        let events: Vec<_> = inner.events[start..end].to_vec();
        let last_seq = events
            .last()
            .map(|event| event.sequence.clone())
            .unwrap_or_else(|| {
                if request.since.as_str() == "now" {
                    inner
                        .events
                        .last()
                        .map(|event| event.sequence.clone())
                        .unwrap_or_else(SequenceToken::start)
                } else {
                    request.since.clone()
                }
            });

        ChangesPage {
            events,
            last_seq,
            pending: Some((inner.events.len() - end) as u64),
        }
    }
}

impl ChangeSource for MemorySource {
    async fn fetch_latest_token(&self) -> EtlResult<SequenceToken> {
        Ok(self.latest_token())
    }

    async fn fetch_sample(&self, limit: usize) -> EtlResult<Vec<Document>> {
        let inner = self.lock();
        if let Some(err) = inner.sample_error.clone() {
            return Err(err);
        }

        // Latest revision of every live document, ordered by id.
        let mut documents = BTreeMap::new();
        for event in &inner.events {
            match (&event.document, event.deleted) {
                (Some(document), false) => {
                    documents.insert(event.id.clone(), document.clone());
                }
                _ => {
                    documents.remove(&event.id);
                }
            }
        }

        Ok(documents.into_values().take(limit).collect())
    }

    async fn fetch_changes(&self, request: ChangesRequest) -> EtlResult<ChangesPage> {
        {
            let mut inner = self.lock();
            inner.requests.push(request.clone());
            if let Some(err) = inner.next_fetch_error.take() {
                return Err(err);
            }
        }

        let page = self.page(&request);
        if let FeedMode::LongPoll { timeout } = request.mode
            && page.events.is_empty()
        {
            let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
            return Ok(self.page(&request));
        }

        Ok(page)
    }
}

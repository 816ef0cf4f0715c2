use config::shared::SourceConfig;
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::source::base::{ChangeSource, ChangesPage, ChangesRequest, FeedMode};
use crate::types::{ChangeEvent, Document, SequenceToken};

/// Extra time granted to a long-poll request on top of the server side timeout.
const LONGPOLL_GRACE: Duration = Duration::from_secs(30);

/// Timeout of requests that return immediately.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<ChangeRow>,
    last_seq: SequenceToken,
    #[serde(default)]
    pending: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    seq: SequenceToken,
    id: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    #[serde(default)]
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    #[serde(default)]
    doc: Option<Document>,
}

impl From<ChangesResponse> for ChangesPage {
    fn from(response: ChangesResponse) -> Self {
        let events = response
            .results
            .into_iter()
            .map(|row| ChangeEvent {
                sequence: row.seq,
                id: row.id,
                document: row.doc,
                deleted: row.deleted,
            })
            .collect();

        ChangesPage {
            events,
            last_seq: response.last_seq,
            pending: response.pending,
        }
    }
}

/// Change source reading one CouchDB database over HTTP.
#[derive(Debug, Clone)]
pub struct CouchDbSource {
    client: Client,
    base_url: Url,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl CouchDbSource {
    pub fn new(config: &SourceConfig) -> EtlResult<Self> {
        let base_url = Url::parse(&config.url).map_err(|err| {
            etl_error!(ErrorKind::ConfigError, "Invalid CouchDB url", err)
        })?;
        if base_url.cannot_be_a_base() {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Invalid CouchDB url",
                config.url
            ));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| {
                etl_error!(
                    ErrorKind::SourceConnectionFailed,
                    "Failed to build CouchDB client",
                    err
                )
            })?;

        Ok(Self {
            client,
            base_url,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config
                .password
                .as_ref()
                .map(|password| password.expose().to_string()),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the url of `endpoint` within the database, with the database name escaped.
    fn endpoint(&self, endpoint: &str) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.database).push(endpoint);
        }

        url
    }

    fn get(&self, url: Url) -> RequestBuilder {
        let request = self.client.get(url);

        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    async fn send<T>(&self, request: RequestBuilder, description: &'static str) -> EtlResult<T>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await.map_err(|err| {
            etl_error!(
                ErrorKind::SourceConnectionFailed,
                "CouchDB request failed",
                err
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(etl_error!(
                ErrorKind::SourceQueryFailed,
                description,
                format!("{status}: {body}")
            ));
        }

        response.json().await.map_err(|err| {
            etl_error!(
                ErrorKind::DeserializationError,
                "Invalid CouchDB response",
                err
            )
        })
    }
}

/// Returns the query string of a changes request.
fn changes_query(request: &ChangesRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("since", request.since.to_string()),
        ("include_docs", "true".to_string()),
        ("limit", request.limit.to_string()),
    ];

    if let FeedMode::LongPoll { timeout } = request.mode {
        query.push(("feed", "longpoll".to_string()));
        query.push(("timeout", timeout.as_millis().to_string()));
    }

    query
}

impl ChangeSource for CouchDbSource {
    async fn fetch_latest_token(&self) -> EtlResult<SequenceToken> {
        let request = self
            .get(self.endpoint("_changes"))
            .query(&[("since", "now"), ("limit", "1")])
            .timeout(REQUEST_TIMEOUT);

        let response: ChangesResponse = self
            .send(request, "Failed to read the latest CouchDB sequence")
            .await?;

        Ok(response.last_seq)
    }

    async fn fetch_sample(&self, limit: usize) -> EtlResult<Vec<Document>> {
        let request = self
            .get(self.endpoint("_all_docs"))
            .query(&[("include_docs", "true".to_string()), ("limit", limit.to_string())])
            .timeout(REQUEST_TIMEOUT);

        let response: AllDocsResponse = self
            .send(request, "Failed to read CouchDB sample documents")
            .await?;

        Ok(response.rows.into_iter().filter_map(|row| row.doc).collect())
    }

    async fn fetch_changes(&self, request: ChangesRequest) -> EtlResult<ChangesPage> {
        let timeout = match request.mode {
            FeedMode::Normal => REQUEST_TIMEOUT,
            FeedMode::LongPoll { timeout } => timeout + LONGPOLL_GRACE,
        };

        let http_request = self
            .get(self.endpoint("_changes"))
            .query(&changes_query(&request))
            .timeout(timeout);

        let response: ChangesResponse = self
            .send(http_request, "Failed to read CouchDB changes")
            .await?;
        debug!(
            database = %self.database,
            results = response.results.len(),
            last_seq = %response.last_seq,
            "received changes"
        );

        Ok(response.into())
    }
}

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, error, info};

use crate::checkpoint::base::CheckpointStore;
use crate::destination::base::{
    ApplyReport, Destination, RowChange, TargetBatch, default_target_name,
};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::schema::{DocumentType, Schema};
use crate::types::{Document, SequenceToken};

/// Index holding the replication checkpoints.
pub const META_INDEX: &str = "couchwarehouse_meta";

/// Top level fields removed from documents before indexing.
const STRIPPED_FIELDS: [&str; 3] = ["_id", "_rev", "_attachments"];

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CheckpointDocument {
    #[serde(rename = "_source")]
    source: CheckpointSource,
}

#[derive(Debug, Deserialize)]
struct CheckpointSource {
    seq: SequenceToken,
}

/// One action of a bulk request, kept to match the response items back to rows.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BulkAction {
    target: String,
    id: String,
    delete: bool,
}

/// Destination indexing whole documents into Elasticsearch.
///
/// Documents are stored as they come from the source, not flattened, with one index per
/// target. Indexes and their mappings are created by Elasticsearch on first write.
#[derive(Debug, Clone)]
pub struct ElasticsearchDestination {
    client: Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticsearchDestination {
    pub fn new(url: &str, username: Option<String>, password: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, format!("{}/{path}", self.url));

        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    fn checkpoint_path(key: &str) -> String {
        format!("{META_INDEX}/_doc/checkpoint-{key}")
    }
}

fn transport_error(err: reqwest::Error) -> EtlError {
    etl_error!(
        ErrorKind::DestinationIoError,
        "Elasticsearch request failed",
        err
    )
}

async fn rejected(response: reqwest::Response, description: &'static str) -> EtlError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    etl_error!(
        ErrorKind::DestinationQueryFailed,
        description,
        format!("{status}: {body}")
    )
}

/// Removes the fields Elasticsearch reserves or cannot index from a source document.
fn strip_document(document: &Document) -> Document {
    document
        .iter()
        .filter(|(key, _)| !STRIPPED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Builds the newline delimited body of a bulk request and the action of each entry.
fn bulk_body(batches: &[TargetBatch]) -> EtlResult<(String, Vec<BulkAction>)> {
    let mut body = String::new();
    let mut actions = Vec::new();

    for batch in batches {
        for change in &batch.changes {
            match change {
                RowChange::Upsert { id, document, .. } => {
                    let action = json!({"index": {"_index": batch.target, "_id": id}});
                    body.push_str(&serde_json::to_string(&action)?);
                    body.push('\n');
                    body.push_str(&serde_json::to_string(&strip_document(document))?);
                    body.push('\n');
                }
                RowChange::Delete { id } => {
                    let action = json!({"delete": {"_index": batch.target, "_id": id}});
                    body.push_str(&serde_json::to_string(&action)?);
                    body.push('\n');
                }
            }

            actions.push(BulkAction {
                target: batch.target.clone(),
                id: change.id().to_string(),
                delete: change.is_delete(),
            });
        }
    }

    Ok((body, actions))
}

/// Matches the items of a bulk response to the actions that produced them.
///
/// Deleting a document that does not exist counts as applied.
fn report_from(actions: &[BulkAction], response: BulkResponse) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (index, action) in actions.iter().enumerate() {
        let item = response
            .items
            .get(index)
            .and_then(|item| item.values().next());

        match item {
            Some(item)
                if (200..300).contains(&item.status)
                    || (action.delete && item.status == StatusCode::NOT_FOUND.as_u16()) =>
            {
                report.record_applied();
            }
            Some(item) => {
                let reason = item
                    .error
                    .as_ref()
                    .map(|error| error.to_string())
                    .unwrap_or_else(|| format!("status {}", item.status));
                error!(index = %action.target, id = %action.id, %reason, "failed to index document");
                report.record_failure(action.target.as_str(), action.id.as_str(), reason);
            }
            None => {
                report.record_failure(
                    action.target.as_str(),
                    action.id.as_str(),
                    "missing from bulk response",
                );
            }
        }
    }

    report
}

impl CheckpointStore for ElasticsearchDestination {
    async fn write_checkpoint(&self, key: &str, token: &SequenceToken) -> EtlResult<()> {
        let response = self
            .request(reqwest::Method::PUT, &Self::checkpoint_path(key))
            .query(&[("refresh", "true")])
            .json(&json!({ "seq": token }))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(rejected(response, "Failed to write Elasticsearch checkpoint").await);
        }

        Ok(())
    }

    async fn read_checkpoint(&self, key: &str) -> EtlResult<Option<SequenceToken>> {
        let response = self
            .request(reqwest::Method::GET, &Self::checkpoint_path(key))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(rejected(response, "Failed to read Elasticsearch checkpoint").await);
        }

        let document: CheckpointDocument = response.json().await?;

        Ok(Some(document.source.seq))
    }
}

impl Destination for ElasticsearchDestination {
    fn name() -> &'static str {
        "elasticsearch"
    }

    async fn initialize(&self, reset: bool) -> EtlResult<()> {
        let response = self
            .request(reqwest::Method::GET, "")
            .send()
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Elasticsearch is unreachable",
                    err
                )
            })?;
        if !response.status().is_success() {
            return Err(rejected(response, "Elasticsearch rejected the connection").await);
        }

        if reset {
            info!("deleting elasticsearch checkpoints");
            let response = self
                .request(reqwest::Method::DELETE, META_INDEX)
                .send()
                .await
                .map_err(transport_error)?;

            if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
                return Err(rejected(response, "Failed to delete Elasticsearch checkpoints").await);
            }
        }

        Ok(())
    }

    fn generate_ddl(&self, _target: &str, _schema: &Schema, _reset: bool) -> Vec<String> {
        Vec::new()
    }

    async fn apply_batch(
        &self,
        ddl: Vec<String>,
        batches: Vec<TargetBatch>,
    ) -> EtlResult<ApplyReport> {
        if !ddl.is_empty() {
            debug!(statements = ddl.len(), "ignoring ddl for elasticsearch");
        }

        let (body, actions) = bulk_body(&batches)?;
        if actions.is_empty() {
            return Ok(ApplyReport::default());
        }

        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(rejected(response, "Elasticsearch bulk request failed").await);
        }

        let response: BulkResponse = response.json().await.map_err(|err| {
            etl_error!(
                ErrorKind::DeserializationError,
                "Invalid Elasticsearch bulk response",
                err
            )
        })?;

        Ok(report_from(&actions, response))
    }

    /// Index names must be lowercase.
    fn target_name_for(&self, database: &str, document_type: &DocumentType, split: bool) -> String {
        default_target_name(database, document_type, split).to_lowercase()
    }
}

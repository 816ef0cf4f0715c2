use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Default CouchDB endpoint.
pub const DEFAULT_SOURCE_URL: &str = "http://localhost:5984";

/// Number of documents fetched for schema discovery at startup.
pub const DEFAULT_SAMPLE_SIZE: usize = 50;

/// How long a long-poll request waits for new changes before returning empty.
pub const DEFAULT_LONGPOLL_TIMEOUT_MS: u64 = 60_000;

/// Configuration for the CouchDB database that is replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceConfig {
    /// Base url of the CouchDB server.
    #[serde(default = "default_url")]
    pub url: String,
    /// Name of the database whose changes feed is consumed.
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Redacted in debug output.
    #[serde(default)]
    pub password: Option<SerializableSecretString>,
    /// Sequence token to start from when no checkpoint exists. Defaults to the beginning.
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_longpoll_timeout_ms")]
    pub longpoll_timeout_ms: u64,
}

fn default_url() -> String {
    DEFAULT_SOURCE_URL.to_string()
}

fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

fn default_longpoll_timeout_ms() -> u64 {
    DEFAULT_LONGPOLL_TIMEOUT_MS
}

impl SourceConfig {
    /// Creates a configuration for `database` on the default local server.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            url: default_url(),
            database: database.into(),
            username: None,
            password: None,
            since: None,
            sample_size: DEFAULT_SAMPLE_SIZE,
            longpoll_timeout_ms: DEFAULT_LONGPOLL_TIMEOUT_MS,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.database.is_empty() {
            return Err(ValidationError::InvalidSource(
                "database cannot be empty".to_string(),
            ));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ValidationError::InvalidSource(
                "url must start with http:// or https://".to_string(),
            ));
        }
        if self.sample_size == 0 {
            return Err(ValidationError::InvalidSource(
                "sample_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

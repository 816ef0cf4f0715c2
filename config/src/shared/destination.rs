use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SerializableSecretString;
use crate::shared::{PgConnectionConfig, ValidationError};

/// Default Elasticsearch endpoint.
pub const DEFAULT_ELASTICSEARCH_URL: &str = "http://localhost:9200";

/// Default MySQL connection url.
pub const DEFAULT_MYSQL_URL: &str = "mysql://root:@localhost:3306/couchwarehouse";

/// Default SQLite database file.
pub const DEFAULT_SQLITE_PATH: &str = "couchwarehouse.sqlite";

/// Prefetch depth used by the embedded SQLite destination when no buffer size is configured.
pub const SQLITE_DEFAULT_BUFFER_SIZE: usize = 16;

/// Configuration options for supported destinations.
///
/// Variants correspond to the destination implementations shipped with the replicator. The
/// destination is chosen once at startup.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationConfig {
    /// In-memory destination, useful for dry runs.
    Memory,
    /// Embedded SQLite database file.
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: String,
    },
    /// Postgres database, written with `INSERT .. ON CONFLICT`.
    Postgres(PgConnectionConfig),
    /// MySQL database, written with `REPLACE INTO`.
    Mysql {
        #[serde(default = "default_mysql_url")]
        url: SerializableSecretString,
    },
    /// Elasticsearch cluster, written with the bulk API.
    Elasticsearch {
        #[serde(default = "default_elasticsearch_url")]
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<SerializableSecretString>,
    },
}

fn default_sqlite_path() -> String {
    DEFAULT_SQLITE_PATH.to_string()
}

fn default_mysql_url() -> SerializableSecretString {
    DEFAULT_MYSQL_URL.into()
}

fn default_elasticsearch_url() -> String {
    DEFAULT_ELASTICSEARCH_URL.to_string()
}

impl DestinationConfig {
    /// Returns the number of batches prefetched when the pipeline does not configure one.
    ///
    /// The embedded SQLite destination trades memory for throughput, every other destination
    /// applies strict backpressure.
    pub fn default_buffer_size(&self) -> usize {
        match self {
            Self::Sqlite { .. } => SQLITE_DEFAULT_BUFFER_SIZE,
            _ => 0,
        }
    }

    /// Validates the destination configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Memory => Ok(()),
            Self::Sqlite { path } => {
                if path.is_empty() {
                    return Err(ValidationError::InvalidDestination(
                        "SQLite path cannot be empty".to_string(),
                    ));
                }

                Ok(())
            }
            Self::Postgres(connection) => connection.validate(),
            Self::Mysql { url } => {
                if !url.expose().starts_with("mysql://") {
                    return Err(ValidationError::InvalidDestination(
                        "MySQL url must start with mysql://".to_string(),
                    ));
                }

                Ok(())
            }
            Self::Elasticsearch { url, .. } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ValidationError::InvalidDestination(
                        "Elasticsearch url must start with http:// or https://".to_string(),
                    ));
                }

                Ok(())
            }
        }
    }
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
            Self::Postgres(connection) => f.debug_tuple("Postgres").field(connection).finish(),
            Self::Mysql { url: _ } => f.debug_struct("Mysql").field("url", &"REDACTED").finish(),
            Self::Elasticsearch {
                url,
                username,
                password: _,
            } => f
                .debug_struct("Elasticsearch")
                .field("url", url)
                .field("username", username)
                .field("password", &"REDACTED")
                .finish(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_prefetches_by_default() {
        assert_eq!(
            DestinationConfig::default().default_buffer_size(),
            SQLITE_DEFAULT_BUFFER_SIZE
        );
        assert_eq!(DestinationConfig::Memory.default_buffer_size(), 0);
    }

    #[test]
    fn rejects_non_http_elasticsearch_url() {
        let config = DestinationConfig::Elasticsearch {
            url: "localhost:9200".to_string(),
            username: None,
            password: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_output_redacts_mysql_url() {
        let config = DestinationConfig::Mysql {
            url: "mysql://root:secret@db/warehouse".into(),
        };

        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn deserializes_snake_case_variants() {
        let config: DestinationConfig =
            serde_json::from_str(r#"{"elasticsearch": {"url": "http://es:9200"}}"#).unwrap();

        assert!(matches!(
            config,
            DestinationConfig::Elasticsearch { ref url, .. } if url == "http://es:9200"
        ));
    }
}

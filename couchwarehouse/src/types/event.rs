use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// A source document: a JSON object carrying `_id`, `_rev` and arbitrary nested fields.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Prefix of reserved design document ids, which are never replicated.
pub const DESIGN_DOCUMENT_PREFIX: &str = "_design";

/// Returns `true` if `id` belongs to a reserved design document.
pub fn is_design_document(id: &str) -> bool {
    id.starts_with(DESIGN_DOCUMENT_PREFIX)
}

/// Opaque position in the source change stream.
///
/// Tokens are stored and compared verbatim. The leading numeric component is only used to
/// estimate progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SequenceToken(String);

impl SequenceToken {
    /// Token denoting the beginning of the stream.
    pub const START: &'static str = "0";

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn start() -> Self {
        Self(Self::START.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the numeric component preceding the first `-`, if there is one.
    ///
    /// `"230-g1AAAA"` yields `Some(230)` and `"17"` yields `Some(17)`.
    pub fn numeric_prefix(&self) -> Option<u64> {
        self.0.split('-').next().and_then(|n| n.parse().ok())
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SequenceToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for SequenceToken {
    /// Accepts both string tokens and the bare integers emitted by older CouchDB releases.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawToken {
            Text(String),
            Number(u64),
        }

        Ok(match RawToken::deserialize(deserializer)? {
            RawToken::Text(text) => Self(text),
            RawToken::Number(number) => Self(number.to_string()),
        })
    }
}

/// A single entry of the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub sequence: SequenceToken,
    pub id: String,
    /// The document body. Absent when the stream is read without documents.
    pub document: Option<Document>,
    pub deleted: bool,
}

impl ChangeEvent {
    /// Returns `true` if the event concerns a reserved design document.
    pub fn is_design(&self) -> bool {
        is_design_document(&self.id)
    }
}

/// An ordered batch of change events, as delivered by the source.
pub type ChangeBatch = Vec<ChangeEvent>;

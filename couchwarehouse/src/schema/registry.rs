use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::schema::{DocumentType, Schema};

#[derive(Debug, Default)]
struct Inner {
    schemas: HashMap<DocumentType, Arc<Schema>>,
}

/// Schemas of the document types seen so far, grown lazily as new types appear.
///
/// Registration is first writer wins: once a type is known its schema never changes for the
/// lifetime of the registry.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schema_for(&self, document_type: &DocumentType) -> Option<Arc<Schema>> {
        let inner = self.inner.lock().await;
        inner.schemas.get(document_type).cloned()
    }

    /// Registers `schema` for `document_type` unless the type is already known.
    ///
    /// Returns `true` if the schema was stored.
    pub async fn register(&self, document_type: DocumentType, schema: Schema) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.schemas.contains_key(&document_type) {
            return false;
        }

        inner.schemas.insert(document_type, Arc::new(schema));

        true
    }

    /// Returns all known document types with their schemas, sorted by type.
    pub async fn entries(&self) -> Vec<(DocumentType, Arc<Schema>)> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<_> = inner
            .schemas
            .iter()
            .map(|(document_type, schema)| (document_type.clone(), schema.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        entries
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.schemas.len()
    }
}

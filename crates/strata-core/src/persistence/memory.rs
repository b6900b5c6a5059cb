//! In-memory document store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DocumentRecord, DocumentStore};
use crate::error::CoreError;

/// Document store backed by an ordered map. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<BTreeMap<String, DocumentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, link: &str) -> Result<Option<DocumentRecord>, CoreError> {
        Ok(self.documents.read().await.get(link).cloned())
    }

    async fn put(&self, record: DocumentRecord) -> Result<(), CoreError> {
        self.documents
            .write()
            .await
            .insert(record.link.clone(), record);
        Ok(())
    }

    async fn delete(&self, link: &str) -> Result<bool, CoreError> {
        Ok(self.documents.write().await.remove(link).is_some())
    }

    async fn list(&self, kind: Option<&str>) -> Result<Vec<DocumentRecord>, CoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}

//! Persistence interfaces and backends for strata-core.
//!
//! Each host keeps a full replica of every document in its own store. The
//! store knows nothing about ownership or versions beyond recording them.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;

/// A stored document body with its metadata broken out for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    /// Self-link, the primary key.
    pub link: String,
    /// Kind tag.
    pub kind: String,
    /// Version, bumped on every committed write.
    pub version: u64,
    /// Commit time in microseconds.
    pub update_time_micros: u64,
    /// Full document body, metadata fields included.
    pub body: Value,
}

/// Document storage used by a service host.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document by link.
    async fn get(&self, link: &str) -> Result<Option<DocumentRecord>, CoreError>;

    /// Insert or replace a document.
    async fn put(&self, record: DocumentRecord) -> Result<(), CoreError>;

    /// Remove a document. Returns whether it existed.
    async fn delete(&self, link: &str) -> Result<bool, CoreError>;

    /// All documents, optionally restricted to one kind, ordered by link.
    async fn list(&self, kind: Option<&str>) -> Result<Vec<DocumentRecord>, CoreError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<bool, CoreError>;
}

//! oplive store: the in-RAM document source and the change tailer that feeds
//! live queries.

#![forbid(unsafe_code)]

mod memory;
mod tailer;

pub use memory::{MemoryDb, UpdateEncoding};
pub use tailer::{ListenerHandle, ResyncReason, TailEvent, Tailer, TailerConfig};

use oplive_core::{Document, QueryDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transient: the backend could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The query itself was rejected.
    #[error("query: {0}")]
    Query(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("document has no string _id")]
    MissingId,
    #[error("write: {0}")]
    Write(String),
}

/// Authoritative document access used for full re-queries and per-id fetches.
#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    /// Database name; drop-database entries for it invalidate every live query.
    fn database(&self) -> &str;

    /// Matching documents in sort order, at most `limit` of them.
    async fn find(&self, query: &QueryDescriptor, limit: Option<usize>) -> Result<Vec<Document>, StoreError>;

    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;
}

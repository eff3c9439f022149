//! Search/index store for processed order records.
//!
//! This module contains:
//! - `SearchIndex` trait: ensure the index exists, write a record
//! - Implementations: Elasticsearch over HTTP, in-memory mock

use async_trait::async_trait;

use crate::order::ProcessedRecord;

mod elasticsearch;
pub mod mock;

pub use elasticsearch::ElasticsearchIndex;
pub use mock::InMemoryIndex;

/// Result type for search operations.
pub type Result<T> = std::result::Result<T, SearchError>;

/// Errors that can occur talking to the search/index store.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search client error: {0}")]
    Client(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("{operation} returned status {status}")]
    UnexpectedStatus { operation: &'static str, status: u16 },
}

/// Document store the processor writes processed records to.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the target index if it does not exist yet.
    async fn ensure_index(&self) -> Result<()>;

    /// Write one processed record.
    async fn write(&self, record: &ProcessedRecord) -> Result<()>;
}

//! Memory repository port.

use async_trait::async_trait;

use crate::domain::models::MemoryEntry;
use crate::domain::ports::errors::StorageResult;

/// Repository interface for durable key/value memory entries.
#[async_trait]
pub trait MemoryRepository: Send + Sync {
    /// Insert or replace an entry.
    async fn put(&self, entry: &MemoryEntry) -> StorageResult<()>;

    /// Get one entry by namespace and key.
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<MemoryEntry>>;

    /// List entries in a namespace whose key contains `search`
    /// (all entries when `search` is empty).
    async fn query(&self, namespace: &str, search: &str) -> StorageResult<Vec<MemoryEntry>>;

    /// Delete an entry. Returns whether a record existed.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;
}

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;

/// A change to a watched key: `value` is `None` when the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// A strongly-consistent key/value store with etcd-style hierarchical keys.
///
/// Single-key reads and writes are atomic; prefix deletes are best-effort
/// bulk operations. Keys written with a TTL disappear after it elapses.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Write a key only if it does not already exist. Fails with
    /// [`StoreError::AlreadyExists`] otherwise.
    async fn put_new(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Every key/value pair below `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError>;

    async fn watch(&self, key: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError>;

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError>;
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::error::StoreError;
use crate::store::{Store, WatchEvent};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    watchers: Vec<(String, mpsc::Sender<WatchEvent>)>,
}

/// In-memory implementation of [`Store`].
///
/// All data is lost on process exit. Suitable for tests and single-node
/// local runs. TTLs are enforced lazily on read.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn live(&self, key: &str) -> Option<&Entry> {
        let entry = self.entries.get(key)?;
        match entry.expires_at {
            Some(at) if at <= Instant::now() => None,
            _ => Some(entry),
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|(prefix, sender)| {
            if !event.key.starts_with(prefix.as_str()) {
                return !sender.is_closed();
            }
            // A full queue or a dropped receiver both drop the watcher.
            sender.try_send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.entries.insert(
            key.to_string(),
            Entry { value: value.clone(), expires_at: ttl.map(|t| Instant::now() + t) },
        );
        guard.notify(WatchEvent { key: key.to_string(), value: Some(value) });
        Ok(())
    }

    async fn put_new(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.live(key).is_some() {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        guard
            .entries
            .insert(key.to_string(), Entry { value: value.clone(), expires_at: None });
        guard.notify(WatchEvent { key: key.to_string(), value: Some(value) });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.live(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| guard.live(key).is_some())
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.entries.remove(key).is_some() {
            guard.notify(WatchEvent { key: key.to_string(), value: None });
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let keys: Vec<String> = guard
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            guard.entries.remove(&key);
            guard.notify(WatchEvent { key, value: None });
        }
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        self.watch_prefix(key).await
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        let (sender, receiver) = mpsc::channel(64);
        let mut guard = self.inner.write().await;
        guard.watchers.push((prefix.to_string(), sender));
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get() {
        let store = InMemoryStore::new();
        store.put("/a/b", b"value".to_vec(), None).await.unwrap();
        assert_eq!(store.get("/a/b").await.unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.get("/a/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_new_rejects_duplicates() {
        let store = InMemoryStore::new();
        store.put_new("/a", b"1".to_vec()).await.unwrap();
        assert!(matches!(
            store.put_new("/a", b"2".to_vec()).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn get_prefix_returns_only_children() {
        let store = InMemoryStore::new();
        store.put("/tr/1/provider/iut", b"a".to_vec(), None).await.unwrap();
        store.put("/tr/1/provider/log-area", b"b".to_vec(), None).await.unwrap();
        store.put("/tr/2/provider/iut", b"c".to_vec(), None).await.unwrap();

        let children = store.get_prefix("/tr/1/provider/").await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|(k, _)| k.starts_with("/tr/1/provider/")));
    }

    #[tokio::test]
    async fn delete_prefix_removes_the_whole_subtree() {
        let store = InMemoryStore::new();
        store.put("/tr/1/a", b"a".to_vec(), None).await.unwrap();
        store.put("/tr/1/b/c", b"b".to_vec(), None).await.unwrap();
        store.put("/tr/2/a", b"c".to_vec(), None).await.unwrap();

        store.delete_prefix("/tr/1").await.unwrap();
        assert!(store.get_prefix("/tr/1").await.unwrap().is_empty());
        assert_eq!(store.get("/tr/2/a").await.unwrap(), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn expired_keys_are_invisible() {
        let store = InMemoryStore::new();
        store.put("/ttl", b"x".to_vec(), Some(Duration::from_millis(5))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("/ttl").await.unwrap(), None);
        assert!(store.get_prefix("/ttl").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_prefix_sees_puts_and_deletes() {
        let store = InMemoryStore::new();
        let mut events = store.watch_prefix("/w/").await.unwrap();

        store.put("/w/key", b"v".to_vec(), None).await.unwrap();
        store.delete("/w/key").await.unwrap();
        store.put("/other", b"v".to_vec(), None).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.key, "/w/key");
        assert_eq!(first.value, Some(b"v".to_vec()));
        let second = events.recv().await.unwrap();
        assert_eq!(second.value, None);
    }
}

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::StoreError;
use crate::store::{Store, WatchEvent};

/// etcd-backed implementation of [`Store`].
///
/// One gRPC client shared by all callers; `etcd_client::Client` is cheap to
/// clone. TTLs map onto leases, `put_new` onto a create-revision transaction,
/// so uniqueness is enforced by the cluster and not by this process.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoint: &str) -> Result<Self, StoreError> {
        let client = Client::connect([endpoint], None).await?;
        Ok(EtcdStore { client })
    }

    pub fn from_client(client: Client) -> Self {
        EtcdStore { client }
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = match ttl {
            Some(ttl) => {
                let lease = client.lease_grant(ttl.as_secs() as i64, None).await?;
                Some(PutOptions::new().with_lease(lease.id()))
            }
            None => None,
        };
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn put_new(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        // create_revision == 0 means the key has never been written.
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let response = client.txn(txn).await?;
        if !response.succeeded() {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut client = self.client.clone();
        let response = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let mut pairs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = kv.key_str().map_err(|e| StoreError::Backend(e.to_string()))?;
            pairs.push((key.to_string(), kv.value().to_vec()));
        }
        Ok(pairs)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(prefix, Some(DeleteOptions::new().with_prefix())).await?;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        self.spawn_watch(key, None).await
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        self.spawn_watch(prefix, Some(WatchOptions::new().with_prefix())).await
    }
}

impl EtcdStore {
    async fn spawn_watch(
        &self,
        key: &str,
        options: Option<WatchOptions>,
    ) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client.watch(key, options).await?;
        let (sender, receiver) = mpsc::channel(64);
        let watched = key.to_string();
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side watch, so it lives
            // for as long as the forwarding task does.
            let _watcher = watcher;
            loop {
                let message = match stream.message().await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(key = %watched, error = %e, "etcd watch stream failed");
                        break;
                    }
                };
                for event in message.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = match kv.key_str() {
                        Ok(key) => key.to_string(),
                        Err(_) => continue,
                    };
                    let value = match event.event_type() {
                        etcd_client::EventType::Put => Some(kv.value().to_vec()),
                        etcd_client::EventType::Delete => None,
                    };
                    if sender.send(WatchEvent { key, value }).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(receiver)
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEntry {
    pub status: TaskStatus,
    pub result: Option<Value>,
}

/// In-process table of background checkout tasks, keyed by the task id the
/// caller polls on. Entries live for the lifetime of the process.
#[derive(Clone, Default)]
pub struct TaskTable {
    inner: Arc<RwLock<HashMap<Uuid, TaskEntry>>>,
}

impl TaskTable {
    /// Run `work` in the background; its Ok value becomes the task result,
    /// its Err value the failure result.
    pub fn spawn<F>(&self, work: F) -> Uuid
    where
        F: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let table = self.inner.clone();
        tokio::spawn(async move {
            {
                let mut guard = table.write().await;
                guard.insert(id, TaskEntry { status: TaskStatus::Started, result: None });
            }
            let entry = match work.await {
                Ok(result) => TaskEntry { status: TaskStatus::Success, result: Some(result) },
                Err(error) => TaskEntry {
                    status: TaskStatus::Failure,
                    result: Some(serde_json::json!({ "error": error })),
                },
            };
            table.write().await.insert(id, entry);
        });
        id
    }

    pub async fn get(&self, id: Uuid) -> TaskEntry {
        self.inner
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or(TaskEntry { status: TaskStatus::Pending, result: None })
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An ordered key/value bag threaded through the checkout pipeline.
///
/// Rule evaluation reads from it, drivers record their checked-out resources
/// in it, and the prepare step hands deep copies of it to worker threads.
/// `Clone` is the deep copy: every value is an owned JSON tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    entries: Map<String, Value>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Shallow-merge a map into the dataset, overwriting existing keys.
    pub fn merge(&mut self, map: &Map<String, Value>) {
        for (key, value) in map {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Dotted-path lookup, e.g. `iut.provider_id`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.entries.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.entries
    }
}

impl From<Map<String, Value>> for Dataset {
    fn from(entries: Map<String, Value>) -> Self {
        Dataset { entries }
    }
}

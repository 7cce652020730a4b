use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use stagehand_domain::{Dataset, Resource, ResourceKind};

use crate::error::ProviderError;

/// The request-scoped dataset, shared between the orchestrator and every
/// driver it instantiates. Locked only for short synchronous sections; the
/// guard is never held across an await point.
pub type SharedDataset = Arc<Mutex<Dataset>>;

/// The uniform provider contract. One driver instance serves one resource
/// kind for one request.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ResourceKind;

    /// Block until between `min` and `max` resources (inclusive) could be
    /// checked out, or the kind-specific timeout fires.
    async fn wait_and_checkout(
        &self,
        min: usize,
        max: usize,
    ) -> Result<Vec<Resource>, ProviderError>;

    /// Return one resource to the provider. Idempotent.
    async fn checkin(&self, resource: &Resource) -> Result<(), ProviderError>;

    /// Release every resource this driver tracks as checked out.
    /// Best-effort: per-resource failures are logged, not raised.
    /// Returns the number of resources released.
    async fn checkin_all(&self) -> usize;
}

// ── Checked-out bookkeeping ───────────────────────────────────────────────────
//
// Drivers record every checked-out resource in the dataset under the kind's
// well-known key, so cleanup needs no bookkeeping beyond the dataset itself.

pub(crate) fn record_checked_out(dataset: &SharedDataset, kind: ResourceKind, resources: &[Resource]) {
    let mut guard = dataset.lock().unwrap_or_else(|e| e.into_inner());
    let entry = guard
        .get_mut(kind.dataset_key())
        .and_then(Value::as_array_mut);
    let serialised = resources.iter().map(|r| Value::Object(r.as_map()));
    match entry {
        Some(existing) => existing.extend(serialised),
        None => {
            let list: Vec<Value> = serialised.collect();
            guard.add(kind.dataset_key(), Value::Array(list));
        }
    }
}

pub(crate) fn tracked(dataset: &SharedDataset, kind: ResourceKind) -> Vec<Resource> {
    let guard = dataset.lock().unwrap_or_else(|e| e.into_inner());
    guard
        .get(kind.dataset_key())
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn untrack(dataset: &SharedDataset, kind: ResourceKind, resource: &Resource) {
    let mut guard = dataset.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(items) = guard.get_mut(kind.dataset_key()).and_then(Value::as_array_mut) {
        let map = Value::Object(resource.as_map());
        items.retain(|item| item != &map);
    }
}

pub(crate) fn untrack_all(dataset: &SharedDataset, kind: ResourceKind) {
    let mut guard = dataset.lock().unwrap_or_else(|e| e.into_inner());
    guard.remove(kind.dataset_key());
}

// ── Executor instructions ─────────────────────────────────────────────────────

/// Guarantee that an execution-space descriptor carries spin-up
/// instructions: an identifier, an image and an environment with a fresh
/// `ENVIRONMENT_ID`. The environment id is what makes the eventual sub-suite
/// unique, so it is generated here and nowhere else.
pub(crate) fn ensure_instructions(resource: &mut Resource, dataset: &Dataset) {
    let mut instructions = resource
        .get("instructions")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if !instructions.contains_key("image") {
        let image = resource
            .get("image")
            .cloned()
            .or_else(|| dataset.get("test_runner").cloned())
            .unwrap_or(Value::Null);
        instructions.insert("image".into(), image);
    }
    instructions
        .entry("parameters".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    instructions.insert("identifier".into(), json!(Uuid::new_v4().to_string()));

    let environment = instructions
        .entry("environment".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(environment) = environment.as_object_mut() {
        environment
            .entry("ENVIRONMENT_ID".to_string())
            .or_insert_with(|| json!(Uuid::new_v4().to_string()));
    }

    resource.set("instructions", Value::Object(instructions));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(extra: Value) -> Resource {
        Resource::new("p1", extra.as_object().cloned().unwrap_or_default()).unwrap()
    }

    #[test]
    fn tracking_round_trips_through_the_dataset() {
        let dataset: SharedDataset = Arc::new(Mutex::new(Dataset::new()));
        let resources = vec![resource(json!({"name": "a"})), resource(json!({"name": "b"}))];
        record_checked_out(&dataset, ResourceKind::Iut, &resources);

        let tracked = tracked(&dataset, ResourceKind::Iut);
        assert_eq!(tracked, resources);

        untrack(&dataset, ResourceKind::Iut, &resources[0]);
        let remaining = super::tracked(&dataset, ResourceKind::Iut);
        assert_eq!(remaining, vec![resources[1].clone()]);
    }

    #[test]
    fn ensure_instructions_generates_environment_id_once() {
        let mut executor = resource(json!({"image": "runner:latest"}));
        ensure_instructions(&mut executor, &Dataset::new());

        let env_id = executor
            .get_path("instructions.environment.ENVIRONMENT_ID")
            .unwrap()
            .clone();
        assert!(Uuid::parse_str(env_id.as_str().unwrap()).is_ok());
        assert_eq!(executor.get_path("instructions.image").unwrap(), &json!("runner:latest"));

        // A second pass keeps the id stable.
        let mut again = executor.clone();
        ensure_instructions(&mut again, &Dataset::new());
        assert_eq!(
            again.get_path("instructions.environment.ENVIRONMENT_ID"),
            Some(&env_id)
        );
    }
}

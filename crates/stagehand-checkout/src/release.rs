//! Release of checked-out environments: one sub-suite at a time or a whole
//! testrun. Each resource goes back to the provider that issued it, and one
//! failing kind never stops the other two from being released.

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use stagehand_config::Config;
use stagehand_domain::{Dataset, Resource, ResourceKind, StoredSubSuite};
use stagehand_provider::{ProviderError, ProviderRegistry, SharedDataset};
use stagehand_store::{Keys, Store};

use crate::error::CheckoutError;

/// The aggregate outcome of a release: failures are collected per resource
/// kind, never short-circuited.
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    pub released: usize,
    pub failures: Vec<(ResourceKind, String)>,
}

impl ReleaseOutcome {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn message(&self) -> String {
        self.failures
            .iter()
            .map(|(kind, message)| format!("failed to release {kind}: {message}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct Releaser {
    store: Arc<dyn Store>,
    config: Config,
}

impl Releaser {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Releaser { store, config }
    }

    /// Release one persisted sub-suite environment. Releasing an environment
    /// that is already gone succeeds with a warning: the desired state is
    /// "released" and it already holds.
    pub async fn release_environment(
        &self,
        testrun_id: &str,
        sub_id: &str,
        environment_id: &str,
    ) -> Result<ReleaseOutcome, CheckoutError> {
        let key = Keys::sub_suite(testrun_id, sub_id, environment_id);
        let Some(payload) = self.store.get(&key).await? else {
            warn!(environment_id, "environment already checked in");
            return Ok(ReleaseOutcome::default());
        };
        let sub_suite = StoredSubSuite::from_json(&payload)?;
        info!(environment_id, name = %sub_suite.name, "releasing environment");

        let mut outcome = ReleaseOutcome::default();
        for (kind, resource) in [
            (ResourceKind::Iut, &sub_suite.iut),
            (ResourceKind::LogArea, &sub_suite.log_area),
            (ResourceKind::ExecutionSpace, &sub_suite.executor),
        ] {
            match self.checkin(testrun_id, kind, resource).await {
                Ok(()) => outcome.released += 1,
                Err(e) => {
                    error!(%kind, provider = %resource.provider_id(), error = %e,
                        "release task failed");
                    outcome.failures.push((kind, e.to_string()));
                }
            }
        }

        self.store.delete(&key).await?;
        self.store
            .delete_prefix(&Keys::environment_prefix(environment_id))
            .await?;
        Ok(outcome)
    }

    /// Resolve the issuing provider from the catalog and hand the resource
    /// back through a fresh driver.
    async fn checkin(
        &self,
        testrun_id: &str,
        kind: ResourceKind,
        resource: &Resource,
    ) -> Result<(), ProviderError> {
        let registry = ProviderRegistry::new(self.store.clone(), Some(testrun_id.to_string()));
        let document = registry
            .provider_by_id(kind, resource.provider_id())
            .await?
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "could not find a {kind} provider with id {:?}",
                    resource.provider_id()
                ))
            })?;

        let dataset: SharedDataset = Arc::new(Mutex::new(Dataset::new()));
        let driver = registry
            .driver_for_document(kind, &document, dataset, &self.config)
            .await?;
        driver.checkin(resource).await
    }

    /// Release every sub-suite of a testrun, then drop everything stored
    /// under it. Returns overall success and the concatenated failures.
    pub async fn release_full_testrun(
        &self,
        testrun_id: &str,
    ) -> Result<(bool, String), CheckoutError> {
        info!(testrun_id, "releasing full testrun");
        let mut messages = Vec::new();
        for (key, _) in self.store.get_prefix(&Keys::suite_prefix(testrun_id)).await? {
            let Some((sub_id, environment_id)) = parse_sub_suite_key(&key) else {
                warn!(key, "unexpected key under the suite prefix");
                continue;
            };
            match self.release_environment(testrun_id, &sub_id, &environment_id).await {
                Ok(outcome) if outcome.success() => {}
                Ok(outcome) => messages.push(outcome.message()),
                Err(e) => messages.push(e.to_string()),
            }
        }
        self.store.delete_prefix(&Keys::testrun_prefix(testrun_id)).await?;
        Ok((messages.is_empty(), messages.join("\n")))
    }

    /// Backwards-compatible single release by environment id only, through
    /// the stored pointers.
    pub async fn release_by_environment_id(
        &self,
        environment_id: &str,
    ) -> Result<ReleaseOutcome, CheckoutError> {
        let testrun_id = self
            .store
            .get(&Keys::environment_testrun_id(environment_id))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());
        let sub_id = self
            .store
            .get(&Keys::suite_id_pointer(environment_id))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());

        let (Some(testrun_id), Some(sub_id)) = (testrun_id, sub_id) else {
            warn!(environment_id, "environment already checked in");
            return Ok(ReleaseOutcome::default());
        };
        let outcome = self.release_environment(&testrun_id, &sub_id, environment_id).await;
        self.store
            .delete_prefix(&Keys::environment_prefix(environment_id))
            .await?;
        outcome
    }

    /// Backwards-compatible full release by the task id returned from the
    /// checkout request.
    pub async fn release_by_task_id(&self, task_id: &str) -> Result<(bool, String), CheckoutError> {
        let Some(raw) = self.store.get(&Keys::suite_id_pointer(task_id)).await? else {
            warn!(task_id, "environment already checked in");
            return Ok((true, String::new()));
        };
        let testrun_id = String::from_utf8_lossy(&raw).into_owned();
        let result = self.release_full_testrun(&testrun_id).await?;
        self.store.delete(&Keys::suite_id_pointer(task_id)).await?;
        Ok(result)
    }
}

/// Pull `(sub_id, environment_id)` out of a
/// `/testrun/{id}/suite/{sub}/subsuite/{env}/suite` key.
fn parse_sub_suite_key(key: &str) -> Option<(String, String)> {
    let mut segments = key.split('/');
    let mut sub_id = None;
    let mut environment_id = None;
    while let Some(segment) = segments.next() {
        match segment {
            "suite" => {
                if let Some(next) = segments.next() {
                    sub_id.get_or_insert_with(|| next.to_string());
                }
            }
            "subsuite" => environment_id = segments.next().map(str::to_string),
            _ => {}
        }
    }
    Some((sub_id?, environment_id?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use stagehand_store::InMemoryStore;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn config() -> Config {
        Config::from_map(&HashMap::new()).unwrap()
    }

    /// Register a local provider whose checkin rule is the given verdict.
    async fn register(store: &Arc<InMemoryStore>, kind: ResourceKind, id: &str, verdict: Value) {
        let registry = ProviderRegistry::new(store.clone() as Arc<dyn Store>, None);
        let document = json!({
            kind.ruleset_key(): {
                "id": id,
                "list": {"possible": [], "available": []},
                "checkin": verdict,
            }
        });
        registry.register_provider(kind, &document).await.unwrap();
    }

    async fn seed_sub_suite(
        store: &Arc<InMemoryStore>,
        testrun_id: &str,
        environment_id: Uuid,
    ) -> String {
        let payload = json!({
            "name": "Suite_SubSuite_0",
            "suite_id": testrun_id,
            "sub_suite_id": Uuid::new_v4().to_string(),
            "test_suite_started_id": "started-1",
            "iut": {"provider_id": "iuts", "name": "box"},
            "executor": {
                "provider_id": "execs",
                "instructions": {"environment": {"ENVIRONMENT_ID": environment_id.to_string()}},
            },
            "log_area": {"provider_id": "logs"},
        });
        let key = Keys::sub_suite(testrun_id, "started-1", &environment_id.to_string());
        store.put(&key, serde_json::to_vec(&payload).unwrap(), None).await.unwrap();
        store
            .put(
                &Keys::environment_testrun_id(&environment_id.to_string()),
                testrun_id.as_bytes().to_vec(),
                None,
            )
            .await
            .unwrap();
        store
            .put(
                &Keys::suite_id_pointer(&environment_id.to_string()),
                b"started-1".to_vec(),
                None,
            )
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn release_environment_returns_all_three_resources() {
        let store = Arc::new(InMemoryStore::new());
        register(&store, ResourceKind::Iut, "iuts", json!(true)).await;
        register(&store, ResourceKind::ExecutionSpace, "execs", json!(true)).await;
        register(&store, ResourceKind::LogArea, "logs", json!(true)).await;
        let environment_id = Uuid::new_v4();
        let key = seed_sub_suite(&store, "testrun-1", environment_id).await;

        let releaser = Releaser::new(store.clone(), config());
        let outcome = releaser
            .release_environment("testrun-1", "started-1", &environment_id.to_string())
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.released, 3);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn releasing_twice_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        register(&store, ResourceKind::Iut, "iuts", json!(true)).await;
        register(&store, ResourceKind::ExecutionSpace, "execs", json!(true)).await;
        register(&store, ResourceKind::LogArea, "logs", json!(true)).await;
        let environment_id = Uuid::new_v4();
        seed_sub_suite(&store, "testrun-1", environment_id).await;

        let releaser = Releaser::new(store.clone(), config());
        releaser
            .release_environment("testrun-1", "started-1", &environment_id.to_string())
            .await
            .unwrap();
        let again = releaser
            .release_environment("testrun-1", "started-1", &environment_id.to_string())
            .await
            .unwrap();
        assert!(again.success());
        assert_eq!(again.released, 0);
    }

    #[tokio::test]
    async fn failing_executor_checkin_does_not_block_the_others() {
        let store = Arc::new(InMemoryStore::new());
        register(&store, ResourceKind::Iut, "iuts", json!(true)).await;
        register(&store, ResourceKind::ExecutionSpace, "execs", json!(false)).await;
        register(&store, ResourceKind::LogArea, "logs", json!(true)).await;
        let environment_id = Uuid::new_v4();
        seed_sub_suite(&store, "testrun-1", environment_id).await;

        let releaser = Releaser::new(store.clone(), config());
        let (success, message) = releaser.release_full_testrun("testrun-1").await.unwrap();
        assert!(!success);
        assert!(message.contains("execution space"), "got: {message}");
        assert!(!message.contains("log area"));

        // The testrun subtree is gone regardless of the failure.
        assert!(store.get_prefix(&Keys::testrun_prefix("testrun-1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_release_empties_the_testrun_prefix() {
        let store = Arc::new(InMemoryStore::new());
        register(&store, ResourceKind::Iut, "iuts", json!(true)).await;
        register(&store, ResourceKind::ExecutionSpace, "execs", json!(true)).await;
        register(&store, ResourceKind::LogArea, "logs", json!(true)).await;
        seed_sub_suite(&store, "testrun-1", Uuid::new_v4()).await;
        seed_sub_suite(&store, "testrun-1", Uuid::new_v4()).await;

        let releaser = Releaser::new(store.clone(), config());
        let (success, message) = releaser.release_full_testrun("testrun-1").await.unwrap();
        assert!(success, "got: {message}");
        assert!(store.get_prefix("/testrun/testrun-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_release_by_environment_id_follows_the_pointers() {
        let store = Arc::new(InMemoryStore::new());
        register(&store, ResourceKind::Iut, "iuts", json!(true)).await;
        register(&store, ResourceKind::ExecutionSpace, "execs", json!(true)).await;
        register(&store, ResourceKind::LogArea, "logs", json!(true)).await;
        let environment_id = Uuid::new_v4();
        seed_sub_suite(&store, "testrun-1", environment_id).await;

        let releaser = Releaser::new(store.clone(), config());
        let outcome =
            releaser.release_by_environment_id(&environment_id.to_string()).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.released, 3);

        // Pointers are gone; a second release is a no-op.
        let again =
            releaser.release_by_environment_id(&environment_id.to_string()).await.unwrap();
        assert_eq!(again.released, 0);
    }

    #[test]
    fn sub_suite_keys_parse_back_into_ids() {
        let key = Keys::sub_suite("tr", "started-1", "env-1");
        assert_eq!(
            parse_sub_suite_key(&key),
            Some(("started-1".to_string(), "env-1".to_string()))
        );
        assert_eq!(parse_sub_suite_key("/testrun/tr/other"), None);
    }
}
